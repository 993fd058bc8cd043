//! State-save area header: version header plus one of three per-version bodies.

use bitflags::bitflags;

use crate::description::SipDescription;
use crate::error::{ensure_len, Result, SipError};
use crate::fifo::SrIdent;
use crate::format::*;
use crate::regset::{RegsetDesc, RegsetType};

/// Number of reconstructed state-base-address registers.
pub const SBA_REGISTER_COUNT: u16 = 9;
pub const SCRATCH_REGISTER_COUNT: u16 = 2;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SipFlags: u32 {
        /// Scratch is addressed without a surface-state heap.
        const HEAPLESS = 1 << 0;
        /// The SIP services SLM and barrier transactions.
        const SLM_ACCESS = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionHeader {
    pub magic: [u8; 8],
    pub version: SipVersion,
    /// Total header size in 8-byte units.
    pub size: u8,
}

impl VersionHeader {
    pub const SIZE_BYTES: usize = VERSION_HEADER_SIZE;

    pub fn new(version: SipVersion, size: u8) -> Self {
        Self {
            magic: *STATE_SAVE_AREA_MAGIC,
            version,
            size,
        }
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE_BYTES {
            return None;
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[VERSION_HEADER_MAGIC_OFFSET..VERSION_HEADER_MAGIC_OFFSET + 8]);
        Some(Self {
            magic,
            version: SipVersion::new(
                buf[VERSION_HEADER_MAJOR_OFFSET],
                buf[VERSION_HEADER_MINOR_OFFSET],
                buf[VERSION_HEADER_PATCH_OFFSET],
            ),
            size: buf[VERSION_HEADER_SIZE_OFFSET],
        })
    }

    /// Checks magic, major version and size without looking at the body.
    pub fn validate(&self) -> Result<()> {
        if &self.magic != STATE_SAVE_AREA_MAGIC {
            return Err(SipError::InvalidMagic);
        }
        if self.version.major > MAX_SUPPORTED_MAJOR {
            return Err(SipError::UnsupportedVersion(self.version.major));
        }
        if self.header_size_bytes() < Self::SIZE_BYTES {
            return Err(SipError::InvalidSize(self.size));
        }
        Ok(())
    }

    pub fn header_size_bytes(&self) -> usize {
        usize::from(self.size) * HEADER_SIZE_UNIT as usize
    }

    fn encode_to_le_bytes(&self, buf: &mut [u8]) {
        buf[VERSION_HEADER_MAGIC_OFFSET..VERSION_HEADER_MAGIC_OFFSET + 8]
            .copy_from_slice(&self.magic);
        buf[VERSION_HEADER_MAJOR_OFFSET] = self.version.major;
        buf[VERSION_HEADER_MINOR_OFFSET] = self.version.minor;
        buf[VERSION_HEADER_PATCH_OFFSET] = self.version.patch;
        buf[VERSION_HEADER_SIZE_OFFSET] = self.size;
    }
}

/// Thread geometry and per-thread slot layout shared by every version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadGeometry {
    pub num_slices: u32,
    pub num_subslices_per_slice: u32,
    pub num_eus_per_subslice: u32,
    pub num_threads_per_eu: u32,
    pub state_area_offset: u32,
    pub state_save_size: u32,
    pub slm_area_offset: u32,
    pub slm_bank_size: u32,
    pub slm_bank_valid: u32,
    /// Offset of the SR ident inside a slot. Reserved in V5.
    pub sr_magic_offset: u32,
}

impl ThreadGeometry {
    fn decode(buf: &[u8]) -> Self {
        Self {
            num_slices: le_u32(buf, NUM_SLICES_OFFSET),
            num_subslices_per_slice: le_u32(buf, NUM_SUBSLICES_PER_SLICE_OFFSET),
            num_eus_per_subslice: le_u32(buf, NUM_EUS_PER_SUBSLICE_OFFSET),
            num_threads_per_eu: le_u32(buf, NUM_THREADS_PER_EU_OFFSET),
            state_area_offset: le_u32(buf, STATE_AREA_OFFSET_OFFSET),
            state_save_size: le_u32(buf, STATE_SAVE_SIZE_OFFSET),
            slm_area_offset: le_u32(buf, SLM_AREA_OFFSET_OFFSET),
            slm_bank_size: le_u32(buf, SLM_BANK_SIZE_OFFSET),
            slm_bank_valid: le_u32(buf, SLM_BANK_VALID_OFFSET),
            sr_magic_offset: le_u32(buf, SR_MAGIC_OFFSET_OFFSET),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        put_u32(buf, NUM_SLICES_OFFSET, self.num_slices);
        put_u32(buf, NUM_SUBSLICES_PER_SLICE_OFFSET, self.num_subslices_per_slice);
        put_u32(buf, NUM_EUS_PER_SUBSLICE_OFFSET, self.num_eus_per_subslice);
        put_u32(buf, NUM_THREADS_PER_EU_OFFSET, self.num_threads_per_eu);
        put_u32(buf, STATE_AREA_OFFSET_OFFSET, self.state_area_offset);
        put_u32(buf, STATE_SAVE_SIZE_OFFSET, self.state_save_size);
        put_u32(buf, SLM_AREA_OFFSET_OFFSET, self.slm_area_offset);
        put_u32(buf, SLM_BANK_SIZE_OFFSET, self.slm_bank_size);
        put_u32(buf, SLM_BANK_VALID_OFFSET, self.slm_bank_valid);
        put_u32(buf, SR_MAGIC_OFFSET_OFFSET, self.sr_magic_offset);
    }

    /// Number of thread slots, or `None` if the dimensions overflow.
    pub fn slot_count(&self) -> Option<u64> {
        u64::from(self.num_slices)
            .checked_mul(u64::from(self.num_subslices_per_slice))?
            .checked_mul(u64::from(self.num_eus_per_subslice))?
            .checked_mul(u64::from(self.num_threads_per_eu))
    }

    /// Walks slice, then subslice, then eu, then thread. `None` outside the geometry.
    pub fn linear_index(&self, slice: u32, subslice: u32, eu: u32, thread: u32) -> Option<u64> {
        if !self.contains(slice, subslice, eu, thread) {
            return None;
        }
        let subslices = u64::from(self.num_subslices_per_slice);
        let eus = u64::from(self.num_eus_per_subslice);
        let threads = u64::from(self.num_threads_per_eu);
        u64::from(slice)
            .checked_mul(subslices)?
            .checked_add(u64::from(subslice))?
            .checked_mul(eus)?
            .checked_add(u64::from(eu))?
            .checked_mul(threads)?
            .checked_add(u64::from(thread))
    }

    pub fn contains(&self, slice: u32, subslice: u32, eu: u32, thread: u32) -> bool {
        slice < self.num_slices
            && subslice < self.num_subslices_per_slice
            && eu < self.num_eus_per_subslice
            && thread < self.num_threads_per_eu
    }
}

/// Attention FIFO geometry (V3 and later).
///
/// `head` and `tail` are snapshots taken when the header was read; the live indices must be
/// re-read from [`FIFO_HEAD_OFFSET`] / [`FIFO_TAIL_OFFSET`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FifoGeometry {
    /// Offset of the node array, relative to the end of the header.
    pub offset: u32,
    /// Number of 4-byte nodes.
    pub size: u32,
    pub head: u32,
    pub tail: u32,
}

/// Fixed register table of versions 0 through 2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LegacyRegsets {
    pub grf: RegsetDesc,
    pub addr: RegsetDesc,
    pub flag: RegsetDesc,
    pub emask: RegsetDesc,
    pub sr: RegsetDesc,
    pub cr: RegsetDesc,
    pub tdr: RegsetDesc,
    pub acc: RegsetDesc,
    pub mme: RegsetDesc,
    pub sp: RegsetDesc,
    pub cmd: RegsetDesc,
    pub dbg: RegsetDesc,
    pub fc: RegsetDesc,
}

impl LegacyRegsets {
    fn fields(&self) -> [&RegsetDesc; LEGACY_REGSET_COUNT] {
        [
            &self.grf, &self.addr, &self.flag, &self.emask, &self.sr, &self.cr, &self.tdr,
            &self.acc, &self.mme, &self.sp, &self.cmd, &self.dbg, &self.fc,
        ]
    }

    fn decode(buf: &[u8], base: usize) -> Self {
        let at = |i: usize| {
            let off = base + i * REGSET_DESC_SIZE;
            RegsetDesc::decode_from_le_bytes(&buf[off..off + REGSET_DESC_SIZE]).unwrap_or_default()
        };
        Self {
            grf: at(0),
            addr: at(1),
            flag: at(2),
            emask: at(3),
            sr: at(4),
            cr: at(5),
            tdr: at(6),
            acc: at(7),
            mme: at(8),
            sp: at(9),
            cmd: at(10),
            dbg: at(11),
            fc: at(12),
        }
    }

    fn encode(&self, buf: &mut [u8], base: usize) {
        for (i, desc) in self.fields().into_iter().enumerate() {
            let off = base + i * REGSET_DESC_SIZE;
            desc.encode_to_le_bytes(&mut buf[off..off + REGSET_DESC_SIZE]);
        }
    }

    pub fn get(&self, ty: RegsetType) -> Option<RegsetDesc> {
        let desc = match ty {
            RegsetType::Grf => self.grf,
            RegsetType::Addr => self.addr,
            RegsetType::Flag => self.flag,
            RegsetType::Ce => self.emask,
            RegsetType::Sr => self.sr,
            RegsetType::Cr => self.cr,
            RegsetType::Tdr => self.tdr,
            RegsetType::Acc => self.acc,
            RegsetType::Mme => self.mme,
            RegsetType::Sp => self.sp,
            RegsetType::Dbg => self.dbg,
            RegsetType::Fc => self.fc,
            _ => return None,
        };
        Some(desc)
    }
}

/// Fixed register table of versions 3 and 4.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct V3Regsets {
    pub base: LegacyRegsets,
    pub scalar: RegsetDesc,
    pub msg: RegsetDesc,
}

impl V3Regsets {
    fn decode(buf: &[u8], base: usize) -> Self {
        let tail = base + LEGACY_REGSET_COUNT * REGSET_DESC_SIZE;
        Self {
            base: LegacyRegsets::decode(buf, base),
            scalar: RegsetDesc::decode_from_le_bytes(&buf[tail..]).unwrap_or_default(),
            msg: RegsetDesc::decode_from_le_bytes(&buf[tail + REGSET_DESC_SIZE..])
                .unwrap_or_default(),
        }
    }

    fn encode(&self, buf: &mut [u8], base: usize) {
        self.base.encode(buf, base);
        let tail = base + LEGACY_REGSET_COUNT * REGSET_DESC_SIZE;
        self.scalar.encode_to_le_bytes(&mut buf[tail..]);
        self.msg
            .encode_to_le_bytes(&mut buf[tail + REGSET_DESC_SIZE..]);
    }

    pub fn get(&self, ty: RegsetType) -> Option<RegsetDesc> {
        match ty {
            RegsetType::Scalar => Some(self.scalar),
            RegsetType::Msg => Some(self.msg),
            _ => self.base.get(ty),
        }
    }
}

/// Register map of a parsed header, selected once from the major version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegsetLayout {
    /// Versions 0, 1 and 2.
    Legacy(LegacyRegsets),
    /// Versions 3 and 4. Only version 3 tables are trusted.
    V3(V3Regsets),
    /// Version 5: descriptors come from a [`SipDescription`].
    Described,
}

impl RegsetLayout {
    fn builtin(&self, major: u8, ty: RegsetType) -> Option<RegsetDesc> {
        match self {
            RegsetLayout::Legacy(regsets) if major < FIFO_MIN_MAJOR => regsets.get(ty),
            RegsetLayout::V3(regsets) if major == FIFO_MIN_MAJOR => regsets.get(ty),
            _ => None,
        }
    }

    fn command(&self, major: u8) -> Option<RegsetDesc> {
        match self {
            RegsetLayout::Legacy(regsets) if major < FIFO_MIN_MAJOR => Some(regsets.cmd),
            RegsetLayout::V3(regsets) if major == FIFO_MIN_MAJOR => Some(regsets.base.cmd),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateSaveAreaHeader {
    pub version: VersionHeader,
    pub geometry: ThreadGeometry,
    pub fifo: Option<FifoGeometry>,
    pub sip_flags: SipFlags,
    pub layout: RegsetLayout,
}

impl StateSaveAreaHeader {
    /// Decodes a header from the start of a state-save area.
    ///
    /// `buf` must hold at least the `size * 8` bytes announced by the version header.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, VERSION_HEADER_SIZE, "version header")?;
        let version = VersionHeader::decode_from_le_bytes(buf).ok_or(SipError::Truncated {
            what: "version header",
            needed: VERSION_HEADER_SIZE,
            len: buf.len(),
        })?;
        version.validate()?;

        let major = version.version.major;
        let required = match major {
            0..=2 => LEGACY_REGSETS_OFFSET + LEGACY_REGSET_COUNT * REGSET_DESC_SIZE,
            3 | 4 => V3_REGSETS_OFFSET + V3_REGSET_COUNT * REGSET_DESC_SIZE,
            _ => SIP_FLAGS_OFFSET + 4,
        };
        if version.header_size_bytes() < required {
            return Err(SipError::InvalidSize(version.size));
        }
        ensure_len(buf, version.header_size_bytes(), "state save area header")?;

        let geometry = ThreadGeometry::decode(buf);
        let (fifo, sip_flags) = if major >= FIFO_MIN_MAJOR {
            let fifo = FifoGeometry {
                offset: le_u32(buf, FIFO_OFFSET_OFFSET),
                size: le_u32(buf, FIFO_SIZE_OFFSET),
                head: le_u32(buf, FIFO_HEAD_OFFSET),
                tail: le_u32(buf, FIFO_TAIL_OFFSET),
            };
            (
                Some(fifo),
                SipFlags::from_bits_retain(le_u32(buf, SIP_FLAGS_OFFSET)),
            )
        } else {
            (None, SipFlags::empty())
        };
        let layout = match major {
            0..=2 => RegsetLayout::Legacy(LegacyRegsets::decode(buf, LEGACY_REGSETS_OFFSET)),
            3 | 4 => RegsetLayout::V3(V3Regsets::decode(buf, V3_REGSETS_OFFSET)),
            _ => RegsetLayout::Described,
        };

        Ok(Self {
            version,
            geometry,
            fifo,
            sip_flags,
            layout,
        })
    }

    pub fn legacy(version: SipVersion, geometry: ThreadGeometry, regsets: LegacyRegsets) -> Self {
        Self {
            version: VersionHeader::new(version, (LEGACY_HEADER_SIZE / 8) as u8),
            geometry,
            fifo: None,
            sip_flags: SipFlags::empty(),
            layout: RegsetLayout::Legacy(regsets),
        }
    }

    pub fn v3(
        version: SipVersion,
        geometry: ThreadGeometry,
        fifo: FifoGeometry,
        sip_flags: SipFlags,
        regsets: V3Regsets,
    ) -> Self {
        Self {
            version: VersionHeader::new(version, (V3_HEADER_SIZE / 8) as u8),
            geometry,
            fifo: Some(fifo),
            sip_flags,
            layout: RegsetLayout::V3(regsets),
        }
    }

    pub fn v5(
        version: SipVersion,
        geometry: ThreadGeometry,
        fifo: FifoGeometry,
        sip_flags: SipFlags,
    ) -> Self {
        Self {
            version: VersionHeader::new(version, (V5_HEADER_SIZE / 8) as u8),
            geometry,
            fifo: Some(fifo),
            sip_flags,
            layout: RegsetLayout::Described,
        }
    }

    /// Serializes the header as the SIP would lay it out in memory.
    pub fn encode_to_le_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.version.header_size_bytes()];
        self.version.encode_to_le_bytes(&mut buf);
        self.geometry.encode(&mut buf);
        if let Some(fifo) = self.fifo {
            put_u32(&mut buf, FIFO_OFFSET_OFFSET, fifo.offset);
            put_u32(&mut buf, FIFO_SIZE_OFFSET, fifo.size);
            put_u32(&mut buf, FIFO_HEAD_OFFSET, fifo.head);
            put_u32(&mut buf, FIFO_TAIL_OFFSET, fifo.tail);
            put_u32(&mut buf, SIP_FLAGS_OFFSET, self.sip_flags.bits());
        }
        match &self.layout {
            RegsetLayout::Legacy(regsets) => regsets.encode(&mut buf, LEGACY_REGSETS_OFFSET),
            RegsetLayout::V3(regsets) => regsets.encode(&mut buf, V3_REGSETS_OFFSET),
            RegsetLayout::Described => {}
        }
        buf
    }

    pub fn major(&self) -> u8 {
        self.version.version.major
    }

    pub fn header_size(&self) -> u64 {
        self.version.header_size_bytes() as u64
    }

    pub fn has_fifo(&self) -> bool {
        self.major() >= FIFO_MIN_MAJOR && self.fifo.is_some()
    }

    pub fn uses_sip_command_resume(&self) -> bool {
        self.major() >= SIP_COMMAND_RESUME_MIN_MAJOR
    }

    /// Byte offset of the first thread slot.
    pub fn state_area_start(&self) -> u64 {
        self.header_size() + u64::from(self.geometry.state_area_offset)
    }

    /// Byte offset of a thread's slot from the start of the state-save area.
    ///
    /// `None` when the coordinates fall outside the header geometry or the offset overflows.
    pub fn thread_slot_offset(&self, slice: u32, subslice: u32, eu: u32, thread: u32) -> Option<u64> {
        self.geometry
            .linear_index(slice, subslice, eu, thread)?
            .checked_mul(u64::from(self.geometry.state_save_size))?
            .checked_add(self.state_area_start())
    }

    /// Whether every slot carries an SR ident marker (all layouts but the described one).
    pub fn has_sr_ident(&self) -> bool {
        !matches!(self.layout, RegsetLayout::Described)
    }

    /// Byte offset of a thread's SR ident. `None` for layouts without a fixed marker and for
    /// coordinates outside the geometry.
    pub fn sr_magic_offset(&self, slice: u32, subslice: u32, eu: u32, thread: u32) -> Option<u64> {
        if !self.has_sr_ident() {
            return None;
        }
        self.thread_slot_offset(slice, subslice, eu, thread)?
            .checked_add(u64::from(self.geometry.sr_magic_offset))
    }

    /// End of the last thread slot, or `None` if the geometry overflows.
    pub fn state_area_end(&self) -> Option<u64> {
        self.geometry
            .slot_count()?
            .checked_mul(u64::from(self.geometry.state_save_size))?
            .checked_add(self.state_area_start())
    }

    /// Byte offset of FIFO node `index` from the start of the state-save area.
    pub fn fifo_node_offset(&self, index: u32) -> Option<u64> {
        let fifo = self.fifo?;
        Some(self.header_size() + u64::from(fifo.offset) + u64::from(index) * 4)
    }

    /// Checks that the slot area and the FIFO can be addressed without overflow and that the
    /// FIFO index snapshot lies inside the node array.
    pub fn validate_geometry(&self) -> Result<()> {
        self.state_area_end()
            .ok_or(SipError::InvalidGeometry("thread slot area overflows"))?;
        if self.has_sr_ident()
            && self.geometry.state_save_size != 0
            && u64::from(self.geometry.sr_magic_offset) + SrIdent::SIZE_BYTES as u64
                > u64::from(self.geometry.state_save_size)
        {
            return Err(SipError::InvalidGeometry("sr ident lies outside the thread slot"));
        }
        if let Some(fifo) = self.fifo.filter(|_| self.has_fifo()) {
            if fifo.size != 0 && (fifo.head >= fifo.size || fifo.tail >= fifo.size) {
                return Err(SipError::InvalidGeometry("fifo index past the node array"));
            }
        }
        Ok(())
    }

    pub fn is_heapless(&self, description: Option<&dyn SipDescription>) -> bool {
        description.is_some() || self.sip_flags.contains(SipFlags::HEAPLESS)
    }

    pub fn supports_slm(&self, description: Option<&dyn SipDescription>) -> bool {
        match description {
            Some(description) => description.supports_slm(),
            None => self.major() >= FIFO_MIN_MAJOR && self.sip_flags.contains(SipFlags::SLM_ACCESS),
        }
    }

    /// Resolves a logical register set, or `None` when this layout does not expose it.
    pub fn regset(
        &self,
        ty: RegsetType,
        description: Option<&dyn SipDescription>,
    ) -> Option<RegsetDesc> {
        let heapless = self.is_heapless(description);
        match ty {
            RegsetType::Sba => {
                let num = if heapless { 0 } else { SBA_REGISTER_COUNT };
                Some(RegsetDesc::flat(0, num, 64, 8))
            }
            RegsetType::ModeFlags => (self.major() >= FIFO_MIN_MAJOR || description.is_some())
                .then(|| RegsetDesc::flat(0, 1, 32, 4)),
            RegsetType::DebugScratch | RegsetType::ThreadScratch => {
                heapless.then(|| RegsetDesc::flat(0, SCRATCH_REGISTER_COUNT, 64, 8))
            }
            _ => match description {
                Some(description) => description.regset(ty),
                None => self.layout.builtin(self.major(), ty),
            },
        }
    }

    /// The SIP command block descriptor (versions with a command channel).
    pub fn command_regset(&self, description: Option<&dyn SipDescription>) -> Option<RegsetDesc> {
        match description {
            Some(description) => description.command_regset(),
            None => self.layout.command(self.major()),
        }
    }

    /// Per-thread SR counter register, used where no SR ident marker exists.
    pub fn sr_counter_regset(
        &self,
        description: Option<&dyn SipDescription>,
    ) -> Option<RegsetDesc> {
        description.and_then(|description| description.sr_counter_regset())
    }

    /// Raw `sip_flags` as exposed through the mode-flags pseudo register.
    pub fn mode_flags(&self) -> u32 {
        self.sip_flags.bits()
    }
}
