//! Packed register sets.
//!
//! A packed descriptor groups registers into "major" entries of `stride` bytes. Inside a major
//! entry, element slot `n` (of `bytes` bytes) holds a register only when bit `n` of `valid_mask`
//! is set. Logical register indices enumerate the valid slots of major 0, then major 1, and so
//! on. Transfers always move whole major entries; packing writes the logical registers back into
//! a raw window previously read from memory so the invalid slots are preserved.

use crate::error::{Result, SipError};
use crate::regset::RegsetDesc;

/// Range of major entries touched by a logical register window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedWindow {
    pub first_major: u32,
    pub major_count: u32,
    pub per_major: u32,
}

impl PackedWindow {
    /// Byte offset of the window relative to the descriptor's offset.
    pub fn byte_offset(&self, desc: &RegsetDesc) -> u64 {
        u64::from(self.first_major) * u64::from(desc.stride)
    }

    pub fn byte_len(&self, desc: &RegsetDesc) -> usize {
        self.major_count as usize * desc.stride as usize
    }
}

pub fn packed_window(desc: &RegsetDesc, start: u32, count: u32) -> Result<PackedWindow> {
    if !desc.is_packed() {
        return Err(SipError::InvalidPackedLayout("descriptor is not packed"));
    }
    let per_major = desc.valid_mask.count_ones();
    if per_major == 0 {
        return Err(SipError::InvalidPackedLayout("empty valid mask"));
    }
    let highest_slot = u64::from(64 - desc.valid_mask.leading_zeros());
    if highest_slot * u64::from(desc.bytes) > u64::from(desc.stride) {
        return Err(SipError::InvalidPackedLayout("valid mask exceeds stride"));
    }
    if count == 0 {
        return Err(SipError::InvalidPackedLayout("empty register window"));
    }
    let end = u64::from(start) + u64::from(count);
    let num_majors = u32::from(desc.num).div_ceil(per_major);
    let first_major = start / per_major;
    let last_major = ((end - 1) / u64::from(per_major)) as u32;
    if end > u64::from(desc.num) || last_major >= num_majors {
        return Err(SipError::InvalidPackedLayout(
            "register window references a missing major entry",
        ));
    }
    Ok(PackedWindow {
        first_major,
        major_count: last_major - first_major + 1,
        per_major,
    })
}

fn nth_valid_slot(valid_mask: u64, n: u32) -> u32 {
    let mut mask = valid_mask;
    for _ in 0..n {
        mask &= mask - 1;
    }
    mask.trailing_zeros()
}

fn element_offset(desc: &RegsetDesc, window: &PackedWindow, index: u32) -> usize {
    let major = index / window.per_major - window.first_major;
    let slot = nth_valid_slot(desc.valid_mask, index % window.per_major);
    major as usize * desc.stride as usize + slot as usize * desc.bytes as usize
}

fn check_buffers(
    desc: &RegsetDesc,
    window: &PackedWindow,
    raw_len: usize,
    logical_len: usize,
    count: u32,
) -> Result<()> {
    if raw_len < window.byte_len(desc) {
        return Err(SipError::Truncated {
            what: "packed register window",
            needed: window.byte_len(desc),
            len: raw_len,
        });
    }
    let needed = count as usize * desc.bytes as usize;
    if logical_len < needed {
        return Err(SipError::Truncated {
            what: "register buffer",
            needed,
            len: logical_len,
        });
    }
    Ok(())
}

/// Extracts `count` logical registers starting at `start` from a raw window.
pub fn unpack_registers(
    desc: &RegsetDesc,
    window: &PackedWindow,
    raw: &[u8],
    start: u32,
    count: u32,
    out: &mut [u8],
) -> Result<()> {
    check_buffers(desc, window, raw.len(), out.len(), count)?;
    let bytes = desc.bytes as usize;
    for i in 0..count {
        let src = element_offset(desc, window, start + i);
        let dst = i as usize * bytes;
        out[dst..dst + bytes].copy_from_slice(&raw[src..src + bytes]);
    }
    Ok(())
}

/// Scatters `count` logical registers starting at `start` into a raw window.
pub fn pack_registers(
    desc: &RegsetDesc,
    window: &PackedWindow,
    input: &[u8],
    start: u32,
    count: u32,
    raw: &mut [u8],
) -> Result<()> {
    check_buffers(desc, window, raw.len(), input.len(), count)?;
    let bytes = desc.bytes as usize;
    for i in 0..count {
        let dst = element_offset(desc, window, start + i);
        let src = i as usize * bytes;
        raw[dst..dst + bytes].copy_from_slice(&input[src..src + bytes]);
    }
    Ok(())
}
