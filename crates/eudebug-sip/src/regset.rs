use bitflags::bitflags;

use crate::format::{le_u16, le_u32, put_u16, put_u32, REGSET_DESC_SIZE};

/// Logical register sets a debugger can address.
///
/// The raw values are the debugger-facing register-set type identifiers and are stable.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegsetType {
    Grf = 1,
    Addr = 2,
    Flag = 3,
    Ce = 4,
    Sr = 5,
    Cr = 6,
    Tdr = 7,
    Acc = 8,
    Mme = 9,
    Sp = 10,
    Sba = 11,
    Dbg = 12,
    Fc = 13,
    ModeFlags = 14,
    DebugScratch = 15,
    ThreadScratch = 16,
    Scalar = 17,
    Msg = 18,
}

impl RegsetType {
    pub const ALL: [RegsetType; 18] = [
        RegsetType::Grf,
        RegsetType::Addr,
        RegsetType::Flag,
        RegsetType::Ce,
        RegsetType::Sr,
        RegsetType::Cr,
        RegsetType::Tdr,
        RegsetType::Acc,
        RegsetType::Mme,
        RegsetType::Sp,
        RegsetType::Sba,
        RegsetType::Dbg,
        RegsetType::Fc,
        RegsetType::ModeFlags,
        RegsetType::DebugScratch,
        RegsetType::ThreadScratch,
        RegsetType::Scalar,
        RegsetType::Msg,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| *ty as u32 == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            RegsetType::Grf => "grf",
            RegsetType::Addr => "addr",
            RegsetType::Flag => "flag",
            RegsetType::Ce => "ce",
            RegsetType::Sr => "sr",
            RegsetType::Cr => "cr",
            RegsetType::Tdr => "tdr",
            RegsetType::Acc => "acc",
            RegsetType::Mme => "mme",
            RegsetType::Sp => "sp",
            RegsetType::Sba => "sba",
            RegsetType::Dbg => "dbg",
            RegsetType::Fc => "fc",
            RegsetType::ModeFlags => "mode_flags",
            RegsetType::DebugScratch => "debug_scratch",
            RegsetType::ThreadScratch => "thread_scratch",
            RegsetType::Scalar => "scalar",
            RegsetType::Msg => "msg",
        }
    }

    /// Register sets computed by the debugger rather than stored in the thread slot.
    pub fn is_synthetic(self) -> bool {
        matches!(
            self,
            RegsetType::Sba
                | RegsetType::ModeFlags
                | RegsetType::DebugScratch
                | RegsetType::ThreadScratch
        )
    }

    pub fn flags(self) -> RegsetFlags {
        match self {
            RegsetType::Grf
            | RegsetType::Addr
            | RegsetType::Flag
            | RegsetType::Sr
            | RegsetType::Cr
            | RegsetType::Acc
            | RegsetType::Mme
            | RegsetType::Sp
            | RegsetType::Dbg
            | RegsetType::Fc
            | RegsetType::Scalar
            | RegsetType::Msg => RegsetFlags::READABLE | RegsetFlags::WRITABLE,
            RegsetType::Ce
            | RegsetType::Tdr
            | RegsetType::Sba
            | RegsetType::ModeFlags
            | RegsetType::DebugScratch
            | RegsetType::ThreadScratch => RegsetFlags::READABLE,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct RegsetFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Location of one register set inside a thread slot.
///
/// `stride == 0` means the registers are laid out as a flat array of `num` elements of `bytes`
/// bytes each. A non-zero `stride` marks a packed set: see [`crate::packing`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RegsetDesc {
    pub offset: u32,
    pub num: u16,
    pub bits: u16,
    pub bytes: u16,
    pub stride: u32,
    pub valid_mask: u64,
}

impl RegsetDesc {
    pub const SIZE_BYTES: usize = REGSET_DESC_SIZE;

    pub const fn flat(offset: u32, num: u16, bits: u16, bytes: u16) -> Self {
        Self {
            offset,
            num,
            bits,
            bytes,
            stride: 0,
            valid_mask: 0,
        }
    }

    pub fn is_packed(&self) -> bool {
        self.stride != 0
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// Total bytes covered by `count` registers of a flat set.
    pub fn span_bytes(&self, count: u32) -> u64 {
        u64::from(count) * u64::from(self.bytes)
    }

    /// Decodes the 10-byte on-disk `{offset u32, num u16, bits u16, bytes u16}` record.
    pub fn decode_from_le_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE_BYTES {
            return None;
        }
        Some(Self::flat(
            le_u32(buf, 0),
            le_u16(buf, 4),
            le_u16(buf, 6),
            le_u16(buf, 8),
        ))
    }

    pub fn encode_to_le_bytes(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.offset);
        put_u16(buf, 4, self.num);
        put_u16(buf, 6, self.bits);
        put_u16(buf, 8, self.bytes);
    }
}
