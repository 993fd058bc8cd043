//! Binary ABI of the GPU system routine (SIP) debug state-save area.
//!
//! The SIP is the interrupt handler that runs on the execution units when a hardware thread hits
//! a breakpoint, an exception or an external halt. It dumps every stopped thread's architectural
//! state into a "state-save area" whose layout is described by a versioned header at the start of
//! the area. This crate decodes that header (major versions 0 through 5), resolves logical
//! register sets to byte ranges inside a per-thread slot, and defines the small auxiliary records
//! the debugger exchanges with the SIP: the SR ident marker, the attention FIFO nodes, the SIP
//! command block, the SBA tracking buffer, render-surface-state records and implicit args.
//!
//! Everything here is pure decode/encode over byte slices. Memory access lives in `eudebug`.

pub mod description;
pub mod error;
pub mod fifo;
pub mod format;
pub mod header;
pub mod packing;
pub mod records;
pub mod regset;

pub use description::SipDescription;
pub use error::{Result, SipError};
pub use fifo::{FifoNode, SrIdent};
pub use format::SipVersion;
pub use header::{
    FifoGeometry, LegacyRegsets, RegsetLayout, SipFlags, StateSaveAreaHeader, ThreadGeometry,
    V3Regsets, VersionHeader,
};
pub use packing::{pack_registers, packed_window, unpack_registers, PackedWindow};
pub use records::{
    decanonize, ImplicitArgs, RenderSurfaceState, SbaTrackedAddresses, SipCommand,
    SipCommandKind,
};
pub use regset::{RegsetDesc, RegsetFlags, RegsetType};
