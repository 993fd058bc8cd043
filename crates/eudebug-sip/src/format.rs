//! Magic values, version tags and fixed byte offsets of the state-save area ABI.
//!
//! All multi-byte fields are little-endian. Offsets are relative to the start of the
//! state-save area (which is also the start of the version header).

use core::fmt;

/// Magic at offset 0 of every state-save area (`"tssarea"` NUL-terminated).
pub const STATE_SAVE_AREA_MAGIC: &[u8; 8] = b"tssarea\0";
/// Magic of the per-thread SR ident marker (`"srmagic"` NUL-terminated).
pub const SR_MAGIC: &[u8; 8] = b"srmagic\0";
/// Magic of the state-base-address tracking buffer (`"sbaarea"` NUL-terminated).
pub const SBA_TRACKING_MAGIC: &[u8; 8] = b"sbaarea\0";

pub const MAX_SUPPORTED_MAJOR: u8 = 5;

/// First major version carrying the attention FIFO and `sip_flags`.
pub const FIFO_MIN_MAJOR: u8 = 3;
/// First major version whose resume goes through the SIP command block.
pub const SIP_COMMAND_RESUME_MIN_MAJOR: u8 = 2;
/// Major version whose register map is only available through a SIP description.
pub const DESCRIBED_MAJOR: u8 = 5;

pub const VERSION_HEADER_SIZE: usize = 16;
pub const VERSION_HEADER_MAGIC_OFFSET: usize = 0;
pub const VERSION_HEADER_MAJOR_OFFSET: usize = 10;
pub const VERSION_HEADER_MINOR_OFFSET: usize = 11;
pub const VERSION_HEADER_PATCH_OFFSET: usize = 12;
pub const VERSION_HEADER_SIZE_OFFSET: usize = 13;

/// The header `size` field counts 8-byte units.
pub const HEADER_SIZE_UNIT: u64 = 8;

pub const NUM_SLICES_OFFSET: usize = 16;
pub const NUM_SUBSLICES_PER_SLICE_OFFSET: usize = 20;
pub const NUM_EUS_PER_SUBSLICE_OFFSET: usize = 24;
pub const NUM_THREADS_PER_EU_OFFSET: usize = 28;
pub const STATE_AREA_OFFSET_OFFSET: usize = 32;
pub const STATE_SAVE_SIZE_OFFSET: usize = 36;
pub const SLM_AREA_OFFSET_OFFSET: usize = 40;
pub const SLM_BANK_SIZE_OFFSET: usize = 44;
pub const SLM_BANK_VALID_OFFSET: usize = 48;
pub const SR_MAGIC_OFFSET_OFFSET: usize = 52;

pub const FIFO_OFFSET_OFFSET: usize = 56;
pub const FIFO_SIZE_OFFSET: usize = 60;
pub const FIFO_HEAD_OFFSET: usize = 64;
pub const FIFO_TAIL_OFFSET: usize = 68;
pub const SIP_FLAGS_OFFSET: usize = 72;

pub const REGSET_DESC_SIZE: usize = 10;
pub const LEGACY_REGSET_COUNT: usize = 13;
pub const V3_REGSET_COUNT: usize = 15;

pub const LEGACY_REGSETS_OFFSET: usize = 56;
pub const V3_REGSETS_OFFSET: usize = 76;

pub const LEGACY_HEADER_SIZE: usize = 192;
pub const V3_HEADER_SIZE: usize = 232;
pub const V5_HEADER_SIZE: usize = 80;

const _: () = {
    assert!(LEGACY_REGSETS_OFFSET + LEGACY_REGSET_COUNT * REGSET_DESC_SIZE <= LEGACY_HEADER_SIZE);
    assert!(V3_REGSETS_OFFSET + V3_REGSET_COUNT * REGSET_DESC_SIZE <= V3_HEADER_SIZE);
    assert!(SIP_FLAGS_OFFSET + 4 <= V5_HEADER_SIZE);
    assert!(LEGACY_HEADER_SIZE % 8 == 0);
    assert!(V3_HEADER_SIZE % 8 == 0);
    assert!(V5_HEADER_SIZE % 8 == 0);
};

/// `major.minor.patch` of a state-save area or SR ident.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SipVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl SipVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for SipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

pub(crate) fn le_u16(buf: &[u8], off: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(b)
}

pub(crate) fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
