//! Debugger memory reads and writes across the default, SLM and barrier spaces.

use eudebug_sip::decanonize;
use serde::{Deserialize, Serialize};

use crate::backend::{DebugBackend, GpuMemory, MemoryHandle};
use crate::error::{DebugError, Result};
use crate::session::DebugSession;
use crate::topology::{ThreadId, ThreadPattern};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySpace {
    #[default]
    Default,
    Slm,
    Barrier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryDesc {
    pub space: MemorySpace,
    pub address: u64,
}

impl MemoryDesc {
    pub const fn new(space: MemorySpace, address: u64) -> Self {
        Self { space, address }
    }

    pub const fn gpu(address: u64) -> Self {
        Self::new(MemorySpace::Default, address)
    }
}

/// Whether bits 63..47 of `address` all match bit 47.
pub fn is_canonical(address: u64) -> bool {
    let top = (address as i64) >> 47;
    top == 0 || top == -1
}

/// Whether the debugger accepts `address` in the default space: either already decanonized
/// (48 bits) or in canonical sign-extended form.
pub fn is_valid_gpu_address(address: u64) -> bool {
    decanonize(address) == address || is_canonical(address)
}

enum Access {
    AllThreads(MemoryHandle),
    Thread(ThreadId),
}

impl<B: DebugBackend> DebugSession<B> {
    fn memory_access(&self, thread: &ThreadPattern, desc: &MemoryDesc) -> Result<Access> {
        if thread.is_all() {
            if desc.space != MemorySpace::Default {
                return Err(DebugError::InvalidArgument(
                    "all-threads access is limited to the default space",
                ));
            }
            return Ok(Access::AllThreads(self.backend.default_memory_handle()));
        }
        if !thread.is_single() {
            return Err(DebugError::InvalidArgument("memory access needs one thread or all"));
        }
        self.stopped_thread(thread).map(Access::Thread)
    }

    fn gpu_address(desc: &MemoryDesc) -> Result<u64> {
        if !is_valid_gpu_address(desc.address) {
            return Err(DebugError::InvalidArgument("address is not a valid gpu address"));
        }
        Ok(decanonize(desc.address))
    }

    pub fn read_memory(
        &mut self,
        thread: ThreadPattern,
        desc: MemoryDesc,
        out: &mut [u8],
    ) -> Result<()> {
        let access = self.memory_access(&thread, &desc)?;
        match (desc.space, access) {
            (MemorySpace::Default, Access::AllThreads(handle)) => {
                let va = Self::gpu_address(&desc)?;
                Ok(self.backend.read_gpu_memory(handle, va, out)?)
            }
            (MemorySpace::Default, Access::Thread(id)) => {
                let va = Self::gpu_address(&desc)?;
                let handle = self.thread_handle(&id);
                Ok(self.backend.read_gpu_memory(handle, va, out)?)
            }
            (MemorySpace::Slm, Access::Thread(id)) => self.slm_read(&id, desc.address, out),
            (MemorySpace::Barrier, Access::Thread(id)) => self.barrier_read(&id, desc.address, out),
            (_, Access::AllThreads(_)) => Err(DebugError::InvalidArgument(
                "all-threads access is limited to the default space",
            )),
        }
    }

    pub fn write_memory(&mut self, thread: ThreadPattern, desc: MemoryDesc, input: &[u8]) -> Result<()> {
        if desc.space == MemorySpace::Barrier {
            return Err(DebugError::UnsupportedFeature("barrier state is read-only"));
        }
        let access = self.memory_access(&thread, &desc)?;
        match (desc.space, access) {
            (MemorySpace::Default, Access::AllThreads(handle)) => {
                let va = Self::gpu_address(&desc)?;
                Ok(self.backend.write_gpu_memory(handle, va, input)?)
            }
            (MemorySpace::Default, Access::Thread(id)) => {
                let va = Self::gpu_address(&desc)?;
                let handle = self.thread_handle(&id);
                Ok(self.backend.write_gpu_memory(handle, va, input)?)
            }
            (MemorySpace::Slm, Access::Thread(id)) => self.slm_write(&id, desc.address, input),
            _ => Err(DebugError::InvalidArgument(
                "all-threads access is limited to the default space",
            )),
        }
    }
}
