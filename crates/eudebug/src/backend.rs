//! Collaborator contracts: GPU memory access and low-level thread control.

use core::fmt;

use thiserror::Error;

use crate::topology::ThreadId;

/// Opaque per-context handle the driver uses to address GPU virtual memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryHandle(pub u64);

impl fmt::Display for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GpuMemoryError {
    #[error("access of {len} bytes at {gpu_va:#x} failed")]
    AccessFailed { gpu_va: u64, len: usize },

    #[error("invalid memory handle {0}")]
    InvalidHandle(MemoryHandle),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ThreadControlError {
    #[error("thread control request failed on tile {tile}")]
    Failed { tile: u32 },

    #[error("tile {tile} is not attached to the device")]
    NoSuchTile { tile: u32 },
}

/// Raw GPU virtual memory access keyed by a memory handle.
pub trait GpuMemory {
    fn read_gpu_memory(
        &mut self,
        handle: MemoryHandle,
        gpu_va: u64,
        buf: &mut [u8],
    ) -> Result<(), GpuMemoryError>;

    fn write_gpu_memory(
        &mut self,
        handle: MemoryHandle,
        gpu_va: u64,
        buf: &[u8],
    ) -> Result<(), GpuMemoryError>;

    fn read_u32(&mut self, handle: MemoryHandle, gpu_va: u64) -> Result<u32, GpuMemoryError> {
        let mut buf = [0u8; 4];
        self.read_gpu_memory(handle, gpu_va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(
        &mut self,
        handle: MemoryHandle,
        gpu_va: u64,
        val: u32,
    ) -> Result<(), GpuMemoryError> {
        self.write_gpu_memory(handle, gpu_va, &val.to_le_bytes())
    }

    fn read_u64(&mut self, handle: MemoryHandle, gpu_va: u64) -> Result<u64, GpuMemoryError> {
        let mut buf = [0u8; 8];
        self.read_gpu_memory(handle, gpu_va, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Everything the session needs from the kernel driver.
///
/// Interrupt and resume requests are fire-and-forget: completion is observed through the
/// state-save area, never through the return value.
pub trait DebugBackend: GpuMemory {
    /// Handle of the context the debugger attached to.
    fn default_memory_handle(&self) -> MemoryHandle;

    /// GPU VA of the context's state-save area; 0 when the context has none.
    fn context_state_save_area_gpu_va(&mut self, handle: MemoryHandle) -> u64;

    /// GPU VA of the driver's SBA tracking buffer; 0 when not tracked.
    fn sba_tracking_gpu_va(&mut self, _handle: MemoryHandle) -> u64 {
        0
    }

    /// Whether the SIP was built for bindless addressing.
    fn is_bindless_system_routine(&self) -> bool {
        false
    }

    /// `(gpu_va, size)` of the per-context debug scratch area, if any.
    fn debug_scratch_area(&self, _handle: MemoryHandle) -> Option<(u64, u64)> {
        None
    }

    /// Raises attention on every thread of a tile.
    fn interrupt_tile(&mut self, tile: u32) -> Result<(), ThreadControlError>;

    /// Lets the listed stopped threads of one tile leave the SIP.
    fn resume_threads(&mut self, tile: u32, threads: &[ThreadId]) -> Result<(), ThreadControlError>;
}
