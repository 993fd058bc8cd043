//! Small fixed-layout records exchanged with the SIP or read from GPU memory.

use crate::error::{ensure_len, Result, SipError};
use crate::format::{le_u32, le_u64, put_u32, put_u64, SBA_TRACKING_MAGIC};

/// Clears the sign-extension bits of a canonical 48-bit GPU virtual address.
pub const fn decanonize(address: u64) -> u64 {
    address & 0x0000_ffff_ffff_ffff
}

pub const SIP_COMMAND_BUFFER_OFFSET: usize = 16;
/// Bytes the SIP can stage per command.
pub const SIP_COMMAND_BUFFER_SIZE: usize = 128;
/// Command block plus staging buffer.
pub const SIP_COMMAND_REGION_SIZE: usize = SIP_COMMAND_BUFFER_OFFSET + SIP_COMMAND_BUFFER_SIZE;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SipCommandKind {
    Resume = 0,
    Ready = 1,
    SlmRead = 2,
    SlmWrite = 3,
    BarrierRead = 4,
}

impl SipCommandKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => SipCommandKind::Resume,
            1 => SipCommandKind::Ready,
            2 => SipCommandKind::SlmRead,
            3 => SipCommandKind::SlmWrite,
            4 => SipCommandKind::BarrierRead,
            _ => return None,
        })
    }
}

/// Command block at the start of the SIP command register set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SipCommand {
    pub command: u32,
    pub size: u32,
    pub offset: u64,
}

impl SipCommand {
    pub const SIZE_BYTES: usize = 16;

    pub fn new(kind: SipCommandKind, size: u32, offset: u64) -> Self {
        Self {
            command: kind as u32,
            size,
            offset,
        }
    }

    pub fn kind(&self) -> Option<SipCommandKind> {
        SipCommandKind::from_raw(self.command)
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE_BYTES {
            return None;
        }
        Some(Self {
            command: le_u32(buf, 0),
            size: le_u32(buf, 4),
            offset: le_u64(buf, 8),
        })
    }

    pub fn encode_to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        put_u32(&mut buf, 0, self.command);
        put_u32(&mut buf, 4, self.size);
        put_u64(&mut buf, 8, self.offset);
        buf
    }
}

/// State-base addresses the driver tracks per context for the debugger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbaTrackedAddresses {
    pub version: u8,
    pub general_state_base: u64,
    pub surface_state_base: u64,
    pub dynamic_state_base: u64,
    pub indirect_object_base: u64,
    pub instruction_base: u64,
    pub bindless_surface_state_base: u64,
    pub bindless_sampler_state_base: u64,
}

impl SbaTrackedAddresses {
    pub const SIZE_BYTES: usize = 80;
    const BASES_OFFSET: usize = 24;

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, Self::SIZE_BYTES, "sba tracking buffer")?;
        if &buf[..8] != SBA_TRACKING_MAGIC {
            return Err(SipError::InvalidMagic);
        }
        let base = |i: usize| le_u64(buf, Self::BASES_OFFSET + i * 8);
        Ok(Self {
            version: buf[16],
            general_state_base: base(0),
            surface_state_base: base(1),
            dynamic_state_base: base(2),
            indirect_object_base: base(3),
            instruction_base: base(4),
            bindless_surface_state_base: base(5),
            bindless_sampler_state_base: base(6),
        })
    }

    pub fn encode_to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[..8].copy_from_slice(SBA_TRACKING_MAGIC);
        buf[16] = self.version;
        let bases = [
            self.general_state_base,
            self.surface_state_base,
            self.dynamic_state_base,
            self.indirect_object_base,
            self.instruction_base,
            self.bindless_surface_state_base,
            self.bindless_sampler_state_base,
        ];
        for (i, value) in bases.into_iter().enumerate() {
            put_u64(&mut buf, Self::BASES_OFFSET + i * 8, value);
        }
        buf
    }
}

/// The parts of a 64-byte render-surface-state record the debugger needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSurfaceState {
    /// Raw (possibly canonical) surface base address.
    pub surface_base_address: u64,
    /// Bytes per row; for scratch surfaces, the per-thread scratch size.
    pub surface_pitch: u32,
}

impl RenderSurfaceState {
    pub const SIZE_BYTES: usize = 64;
    const PITCH_DWORD_OFFSET: usize = 12;
    const BASE_ADDRESS_OFFSET: usize = 32;
    const PITCH_MASK: u32 = 0x3_ffff;

    pub fn decode_from_le_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE_BYTES {
            return None;
        }
        Some(Self {
            surface_base_address: le_u64(buf, Self::BASE_ADDRESS_OFFSET),
            surface_pitch: (le_u32(buf, Self::PITCH_DWORD_OFFSET) & Self::PITCH_MASK) + 1,
        })
    }

    pub fn encode_to_le_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        put_u32(
            &mut buf,
            Self::PITCH_DWORD_OFFSET,
            self.surface_pitch.saturating_sub(1) & Self::PITCH_MASK,
        );
        put_u64(&mut buf, Self::BASE_ADDRESS_OFFSET, self.surface_base_address);
        buf
    }

    pub fn base_address(&self) -> u64 {
        decanonize(self.surface_base_address)
    }
}

/// Versioned kernel implicit-args block; only the scratch pointer is of interest here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImplicitArgs {
    V1 { struct_size: u8, scratch_ptr: u64 },
}

impl ImplicitArgs {
    /// Bytes to read before the version is known.
    pub const PREFIX_SIZE: usize = 2;
    pub const V1_SIZE_BYTES: usize = 128;
    const V1_SCRATCH_PTR_OFFSET: usize = 96;

    /// Size of the full struct for a given version, as read from the prefix.
    pub fn struct_size_for(prefix: &[u8]) -> Result<usize> {
        ensure_len(prefix, Self::PREFIX_SIZE, "implicit args prefix")?;
        match prefix[1] {
            1 => Ok(Self::V1_SIZE_BYTES),
            version => Err(SipError::UnsupportedImplicitArgsVersion(version)),
        }
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self> {
        Self::struct_size_for(buf)?;
        ensure_len(buf, Self::V1_SIZE_BYTES, "implicit args v1")?;
        Ok(ImplicitArgs::V1 {
            struct_size: buf[0],
            scratch_ptr: le_u64(buf, Self::V1_SCRATCH_PTR_OFFSET),
        })
    }

    pub fn encode_v1(scratch_ptr: u64) -> [u8; Self::V1_SIZE_BYTES] {
        let mut buf = [0u8; Self::V1_SIZE_BYTES];
        buf[0] = Self::V1_SIZE_BYTES as u8;
        buf[1] = 1;
        put_u64(&mut buf, Self::V1_SCRATCH_PTR_OFFSET, scratch_ptr);
        buf
    }

    pub fn scratch_ptr(&self) -> u64 {
        match self {
            ImplicitArgs::V1 { scratch_ptr, .. } => *scratch_ptr,
        }
    }
}
