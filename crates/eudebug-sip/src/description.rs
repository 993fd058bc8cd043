use crate::regset::{RegsetDesc, RegsetType};

/// Register map supplied by the SIP binary itself instead of the state-save area header.
///
/// Version 5 state-save areas carry no register table; the debugger obtains descriptors
/// (including packed `stride`/`valid_mask` metadata) from the SIP's embedded description. When a
/// description is present it also overrides the built-in tables of older layouts.
pub trait SipDescription {
    /// Descriptor for a slot-resident register set, `None` when the SIP does not know it.
    fn regset(&self, ty: RegsetType) -> Option<RegsetDesc>;

    /// Location of the SIP command block inside a thread slot.
    fn command_regset(&self) -> Option<RegsetDesc>;

    /// Per-thread SR counter register (one 32-bit element).
    fn sr_counter_regset(&self) -> Option<RegsetDesc>;

    fn supports_slm(&self) -> bool {
        false
    }
}
