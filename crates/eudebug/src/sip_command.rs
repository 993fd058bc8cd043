//! SLM and barrier access through the SIP command channel.
//!
//! The SIP owns a per-thread command block followed by a staging buffer. Each transaction moves
//! at most one staging buffer worth of data: the debugger waits for `Ready`, stages input,
//! posts the command and kicks the thread, then waits for `Ready` again and collects output.

use std::slice;

use eudebug_sip::records::{SIP_COMMAND_BUFFER_OFFSET, SIP_COMMAND_BUFFER_SIZE};
use eudebug_sip::{SipCommand, SipCommandKind};
use tracing::{debug, trace, warn};

use crate::backend::{DebugBackend, GpuMemory, MemoryHandle};
use crate::error::{DebugError, Result};
use crate::session::DebugSession;
use crate::topology::ThreadId;

/// Addresses of one thread's SIP transfer window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SipTransferAddr {
    /// GPU VA of the command block.
    pub sip_offset: u64,
    /// Bytes the staging buffer holds.
    pub sip_size: usize,
    /// GPU VA of the staging buffer.
    pub gpu_mem_offset: u64,
}

impl<B: DebugBackend> DebugSession<B> {
    pub(crate) fn sip_transfer_addr(
        &mut self,
        id: &ThreadId,
    ) -> Result<(MemoryHandle, SipTransferAddr)> {
        let handle = self.thread_handle(id);
        let (ssa_va, header) = self.state_save_area(handle)?;
        if !header.supports_slm(self.description()) {
            return Err(DebugError::UnsupportedFeature("sip does not support slm access"));
        }
        let cmd = header
            .command_regset(self.description())
            .ok_or(DebugError::UnsupportedFeature("sip has no command channel"))?;
        let sip_offset = self.slot_gpu_va(ssa_va, &header, id)? + u64::from(cmd.offset);
        Ok((
            handle,
            SipTransferAddr {
                sip_offset,
                sip_size: SIP_COMMAND_BUFFER_SIZE,
                gpu_mem_offset: sip_offset + SIP_COMMAND_BUFFER_OFFSET as u64,
            },
        ))
    }

    /// Polls the command block until the SIP reports `Ready`, within the configured retries.
    pub(crate) fn wait_for_sip_ready(
        &mut self,
        handle: MemoryHandle,
        addr: &SipTransferAddr,
    ) -> Result<()> {
        let attempts = self.config.sip_command_max_retries.max(1);
        for attempt in 0..attempts {
            let mut raw = [0u8; SipCommand::SIZE_BYTES];
            self.backend
                .read_gpu_memory(handle, addr.sip_offset, &mut raw)?;
            let kind = SipCommand::decode_from_le_bytes(&raw).and_then(|cmd| cmd.kind());
            if kind == Some(SipCommandKind::Ready) {
                return Ok(());
            }
            if attempt + 1 < attempts {
                self.clock.sleep(self.config.sip_command_retry_delay());
            }
        }
        warn!(
            gpu_va = format_args!("{:#x}", addr.sip_offset),
            attempts, "sip command timed out"
        );
        Err(DebugError::Unknown("sip did not report ready"))
    }

    /// Posts `command`, lets the SIP run it and waits until it parks again.
    fn run_sip_command(
        &mut self,
        id: &ThreadId,
        handle: MemoryHandle,
        addr: &SipTransferAddr,
        command: SipCommand,
    ) -> Result<()> {
        trace!(thread = %id, ?command, "sip command");
        self.backend
            .write_gpu_memory(handle, addr.sip_offset, &command.encode_to_le_bytes())?;
        self.backend.resume_threads(id.tile, slice::from_ref(id))?;
        self.wait_for_sip_ready(handle, addr)?;

        // The thread stopped again inside the SIP; this is not a new stop.
        let (ssa_va, header) = self.state_save_area(handle)?;
        if let Some(counter) = self.read_sr_counter(id, handle, ssa_va, &header)? {
            if let Some(thread) = self.thread_mut(id) {
                thread.update_counter(counter);
            }
        }
        Ok(())
    }

    fn sip_read(
        &mut self,
        id: &ThreadId,
        kind: SipCommandKind,
        offset: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let (handle, addr) = self.sip_transfer_addr(id)?;
        let mut pos = offset;
        for chunk in out.chunks_mut(addr.sip_size) {
            self.wait_for_sip_ready(handle, &addr)?;
            let command = SipCommand::new(kind, chunk.len() as u32, pos);
            self.run_sip_command(id, handle, &addr, command)?;
            self.backend
                .read_gpu_memory(handle, addr.gpu_mem_offset, chunk)?;
            pos += chunk.len() as u64;
        }
        debug!(thread = %id, ?kind, offset, len = out.len(), "sip read complete");
        Ok(())
    }

    pub(crate) fn slm_read(&mut self, id: &ThreadId, offset: u64, out: &mut [u8]) -> Result<()> {
        self.sip_read(id, SipCommandKind::SlmRead, offset, out)
    }

    pub(crate) fn barrier_read(&mut self, id: &ThreadId, offset: u64, out: &mut [u8]) -> Result<()> {
        self.sip_read(id, SipCommandKind::BarrierRead, offset, out)
    }

    pub(crate) fn slm_write(&mut self, id: &ThreadId, offset: u64, input: &[u8]) -> Result<()> {
        let (handle, addr) = self.sip_transfer_addr(id)?;
        let mut pos = offset;
        for chunk in input.chunks(addr.sip_size) {
            self.wait_for_sip_ready(handle, &addr)?;
            self.backend
                .write_gpu_memory(handle, addr.gpu_mem_offset, chunk)?;
            let command = SipCommand::new(SipCommandKind::SlmWrite, chunk.len() as u32, pos);
            self.run_sip_command(id, handle, &addr, command)?;
            pos += chunk.len() as u64;
        }
        debug!(thread = %id, offset, len = input.len(), "slm write complete");
        Ok(())
    }
}
