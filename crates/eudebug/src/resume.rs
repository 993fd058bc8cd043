//! Resuming stopped threads and confirming they left the SIP.

use std::collections::BTreeMap;

use eudebug_sip::{RegsetDesc, RegsetType, SipCommand, SipCommandKind, StateSaveAreaHeader};
use tracing::{debug, warn};

use crate::backend::{DebugBackend, GpuMemory, MemoryHandle};
use crate::error::{DebugError, Result};
use crate::registers::RegisterIo;
use crate::session::DebugSession;
use crate::topology::{ThreadId, ThreadPattern};

/// Bit the SIP checks in the thread state to leave its handler on pre-command layouts.
const RESUME_WA_BIT: u32 = 0x4000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeMode {
    /// Debugger request: only threads the debugger was told about.
    Requested,
    /// Cleanup of threads that stopped without a reason worth reporting.
    Force,
}

/// Resume signal of one thread, resolved before anything is written.
#[derive(Clone, Copy, Debug)]
enum ResumeTarget {
    NotNeeded,
    /// GPU VA of the thread's SIP command block.
    Command(u64),
    /// Resume bit in dword `dword` of the first register of `desc`.
    WorkaroundBit { desc: RegsetDesc, dword: usize },
}

impl<B: DebugBackend> DebugSession<B> {
    /// Resumes the stopped threads matched by `pattern`.
    ///
    /// Threads whose stop has not been delivered as an event yet are left stopped. Fails with
    /// not-available when no matching thread can be resumed.
    pub fn resume(&mut self, pattern: ThreadPattern) -> Result<()> {
        let tiles = self.attached_tiles_of(&pattern)?;
        let mut resumed_any = false;
        for tile in tiles {
            let threads: Vec<ThreadId> = self.tiles[tile as usize]
                .registry()
                .stopped_threads(&self.device, &pattern)
                .into_iter()
                .filter(|id| self.thread(id).is_some_and(|t| t.is_reported_stopped()))
                .collect();
            if threads.is_empty() {
                continue;
            }
            self.resume_threads_within_tile(tile, &threads, ResumeMode::Requested)?;
            resumed_any = true;
        }
        if !resumed_any {
            return Err(DebugError::NotAvailable("no matching thread is stopped"));
        }
        Ok(())
    }

    pub(crate) fn resume_accidentally_stopped_threads(&mut self, threads: &[ThreadId]) {
        let mut by_tile: BTreeMap<u32, Vec<ThreadId>> = BTreeMap::new();
        for id in threads {
            by_tile.entry(id.tile).or_default().push(*id);
        }
        for (tile, threads) in by_tile {
            if let Err(err) = self.resume_threads_within_tile(tile, &threads, ResumeMode::Force) {
                warn!(tile, %err, "failed to resume accidentally stopped threads");
            }
        }
    }

    /// Issues one resume for `threads` (all on `tile`) per context, then confirms it.
    pub(crate) fn resume_threads_within_tile(
        &mut self,
        tile: u32,
        threads: &[ThreadId],
        mode: ResumeMode,
    ) -> Result<()> {
        let mut by_handle: BTreeMap<MemoryHandle, Vec<ThreadId>> = BTreeMap::new();
        for id in threads {
            by_handle.entry(self.thread_handle(id)).or_default().push(*id);
        }

        for (handle, group) in by_handle {
            let (ssa_va, header) = self.state_save_area(handle)?;
            let targets = group
                .iter()
                .map(|id| self.resume_target(id, ssa_va, &header))
                .collect::<Result<Vec<_>>>()?;
            for (i, (id, target)) in group.iter().zip(&targets).enumerate() {
                if let Err(err) = self.write_resume_command(id, handle, target) {
                    warn!(
                        tile,
                        thread = %id,
                        written = ?&group[..i],
                        %err,
                        "resume aborted with commands already written"
                    );
                    return Err(err);
                }
            }
            self.backend.resume_threads(tile, &group)?;
            for id in &group {
                if let Some(thread) = self.thread_mut(id) {
                    thread.begin_resume();
                }
            }
            self.confirm_threads_resumed(handle, ssa_va, &header, &group);
            debug!(tile, %handle, count = group.len(), ?mode, "threads resumed");
        }
        Ok(())
    }

    /// Where the SIP expects the resume signal for `id`. Does no I/O.
    fn resume_target(
        &self,
        id: &ThreadId,
        ssa_va: u64,
        header: &StateSaveAreaHeader,
    ) -> Result<ResumeTarget> {
        if header.uses_sip_command_resume() {
            let cmd = header
                .command_regset(self.description())
                .ok_or(DebugError::UnsupportedFeature("sip has no command channel"))?;
            let va = self.slot_gpu_va(ssa_va, header, id)? + u64::from(cmd.offset);
            return Ok(ResumeTarget::Command(va));
        }
        if !self.device.resume_wa_required {
            return Ok(ResumeTarget::NotNeeded);
        }

        let (ty, dword) = if self.backend.is_bindless_system_routine() {
            (RegsetType::Cr, 1)
        } else {
            (RegsetType::Grf, 4)
        };
        let desc = header
            .regset(ty, self.description())
            .ok_or(DebugError::Unknown("resume register is not described"))?;
        if usize::from(desc.bytes) < (dword + 1) * 4 {
            return Err(DebugError::Unknown("resume register is too small"));
        }
        Ok(ResumeTarget::WorkaroundBit { desc, dword })
    }

    /// Tells the SIP to let `id` go: a resume command on layouts with a command channel, the
    /// resume bit in the thread state on older hardware that needs it.
    fn write_resume_command(
        &mut self,
        id: &ThreadId,
        handle: MemoryHandle,
        target: &ResumeTarget,
    ) -> Result<()> {
        match *target {
            ResumeTarget::NotNeeded => Ok(()),
            ResumeTarget::Command(va) => {
                let command = SipCommand::new(SipCommandKind::Resume, 0, 0);
                self.backend
                    .write_gpu_memory(handle, va, &command.encode_to_le_bytes())?;
                Ok(())
            }
            ResumeTarget::WorkaroundBit { desc, dword } => {
                let mut reg = vec![0u8; usize::from(desc.bytes)];
                self.registers_access_helper(id, &desc, 0, 1, RegisterIo::Read(&mut reg))?;
                let off = dword * 4;
                let value =
                    u32::from_le_bytes([reg[off], reg[off + 1], reg[off + 2], reg[off + 3]]);
                reg[off..off + 4].copy_from_slice(&(value | RESUME_WA_BIT).to_le_bytes());
                self.registers_access_helper(id, &desc, 0, 1, RegisterIo::Write(&reg))
            }
        }
    }

    /// Polls SR counters until each thread's counter moved away from its stop value.
    ///
    /// Read failures and threads still unchanged after the poll budget count as resumed.
    fn confirm_threads_resumed(
        &mut self,
        handle: MemoryHandle,
        ssa_va: u64,
        header: &StateSaveAreaHeader,
        threads: &[ThreadId],
    ) {
        let bulk = threads.len() >= self.config.resume_bulk_read_threshold.max(1)
            && header.has_sr_ident();
        let mut pending: Vec<ThreadId> = threads.to_vec();

        for poll in 0..self.config.resume_confirm_max_polls {
            if poll > 0 {
                self.clock.sleep(self.config.resume_confirm_poll_delay());
            }
            let snapshot = if bulk {
                self.read_thread_area(handle, ssa_va, header)
            } else {
                None
            };

            let mut still_pending = Vec::new();
            for id in pending {
                let counter = match &snapshot {
                    Some(raw) => self.sr_counter_from_snapshot(&id, header, raw),
                    None if bulk => None,
                    None => self
                        .read_sr_counter(&id, handle, ssa_va, header)
                        .unwrap_or_else(|err| {
                            debug!(thread = %id, %err, "sr counter read failed");
                            None
                        }),
                };
                if self.check_thread_is_resumed(&id, counter) {
                    continue;
                }
                still_pending.push(id);
            }
            pending = still_pending;
            if pending.is_empty() {
                return;
            }
        }

        for id in pending {
            warn!(thread = %id, "resume not confirmed, assuming running");
            if let Some(thread) = self.thread_mut(&id) {
                thread.confirm_resumed(None);
            }
        }
    }

    /// Snapshot of every thread slot, starting at the first one.
    fn read_thread_area(
        &mut self,
        handle: MemoryHandle,
        ssa_va: u64,
        header: &StateSaveAreaHeader,
    ) -> Option<Vec<u8>> {
        let start = header.state_area_start();
        let len = header.state_area_end()?.checked_sub(start)?;
        let mut raw = vec![0u8; usize::try_from(len).ok()?];
        match self.backend.read_gpu_memory(handle, ssa_va + start, &mut raw) {
            Ok(()) => Some(raw),
            Err(err) => {
                debug!(%err, "bulk state save area read failed");
                None
            }
        }
    }

    /// Applies one counter observation; returns whether the thread now counts as running.
    pub fn check_thread_is_resumed(&mut self, id: &ThreadId, counter: Option<u32>) -> bool {
        let Some(thread) = self.thread_mut(id) else {
            return true;
        };
        if thread.is_running() {
            return true;
        }
        if thread.is_stopped() {
            return false;
        }
        match counter {
            Some(counter) if counter == thread.last_counter() => false,
            counter => {
                thread.confirm_resumed(counter);
                true
            }
        }
    }
}
