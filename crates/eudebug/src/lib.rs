//! EU hardware debug session engine.
//!
//! A [`DebugSession`] sits between a debugger API layer and a kernel-driver backend. It tracks
//! every hardware thread of every attached tile, discovers threads that stopped in the system
//! routine (SIP), turns them into [`DebugEvent`]s, and gives the debugger register and memory
//! access to stopped threads through the state-save area the SIP maintains.
//!
//! The engine never spawns threads. The driver calls [`DebugSession::tick`] (or
//! [`DebugSession::read_event`]) from its own loop; every wait is a bounded poll against the
//! session's [`Clock`], with limits taken from [`DebugConfig`].

mod attention;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod memory;
pub mod registers;
pub mod resume;
pub mod session;
pub mod sip_command;
mod ssa;
pub mod thread;
pub mod topology;

pub use backend::{DebugBackend, GpuMemory, GpuMemoryError, MemoryHandle, ThreadControlError};
pub use clock::{Clock, FakeClock, StdClock};
pub use config::DebugConfig;
pub use error::{DebugError, ErrorKind, Result};
pub use events::{DebugEvent, EventQueue};
pub use interrupt::{is_force_exception_or_force_external_halt_only, PendingInterrupt};
pub use memory::{is_canonical, is_valid_gpu_address, MemoryDesc, MemorySpace};
pub use registers::RegisterSetProperties;
pub use resume::ResumeMode;
pub use session::{DebugSession, TileSession};
pub use sip_command::SipTransferAddr;
pub use thread::{EuThread, EuThreadRegistry, ThreadState};
pub use topology::{DeviceInfo, ThreadId, ThreadPattern, Topology, WILDCARD};

pub use eudebug_sip as sip;
