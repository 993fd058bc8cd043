//! Attention FIFO nodes and the per-thread SR ident marker.

use crate::format::{SipVersion, SR_MAGIC};

pub const FIFO_NODE_SIZE: usize = 4;

/// One entry of the attention FIFO written by the SIP when a thread raises attention.
///
/// Bit 0 is the valid flag; the remaining bytes carry the thread coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FifoNode(pub u32);

impl FifoNode {
    pub const INVALID: FifoNode = FifoNode(0);

    pub const fn new(slice: u8, subslice: u8, eu: u8, thread: u8) -> Self {
        Self(
            1 | ((thread as u32 & 0x7f) << 1)
                | ((eu as u32) << 8)
                | ((subslice as u32) << 16)
                | ((slice as u32) << 24),
        )
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Option<Self> {
        let raw: [u8; FIFO_NODE_SIZE] = buf.get(..FIFO_NODE_SIZE)?.try_into().ok()?;
        Some(Self(u32::from_le_bytes(raw)))
    }

    pub fn valid(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn thread(self) -> u32 {
        (self.0 >> 1) & 0x7f
    }

    pub fn eu(self) -> u32 {
        (self.0 >> 8) & 0xff
    }

    pub fn subslice(self) -> u32 {
        (self.0 >> 16) & 0xff
    }

    pub fn slice(self) -> u32 {
        self.0 >> 24
    }
}

/// Marker at `sr_magic_offset` inside every pre-V5 thread slot.
///
/// `count` is incremented by the SIP on every stop and every resume, so an odd value means the
/// thread is parked in the SIP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SrIdent {
    pub magic: [u8; 8],
    pub count: u8,
    pub version: SipVersion,
}

impl SrIdent {
    pub const SIZE_BYTES: usize = 16;

    pub fn new(count: u8, version: SipVersion) -> Self {
        Self {
            magic: *SR_MAGIC,
            count,
            version,
        }
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE_BYTES {
            return None;
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[..8]);
        Some(Self {
            magic,
            count: buf[8],
            version: SipVersion::new(buf[9], buf[10], buf[11]),
        })
    }

    pub fn encode_to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[..8].copy_from_slice(&self.magic);
        buf[8] = self.count;
        buf[9] = self.version.major;
        buf[10] = self.version.minor;
        buf[11] = self.version.patch;
        buf
    }

    /// The SIP has never written this slot.
    pub fn is_zeroed(&self) -> bool {
        self.magic == [0u8; 8]
    }

    pub fn is_valid(&self) -> bool {
        &self.magic == SR_MAGIC
    }
}
