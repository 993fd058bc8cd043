//! Fake driver backend with a small SIP model behind it.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Once;

use eudebug::sip::format::{FIFO_HEAD_OFFSET, FIFO_TAIL_OFFSET};
use eudebug::sip::{
    FifoGeometry, FifoNode, LegacyRegsets, RegsetDesc, RegsetType, SipCommand, SipCommandKind,
    SipDescription, SipFlags, SipVersion, SrIdent, StateSaveAreaHeader, ThreadGeometry,
    V3Regsets,
};
use eudebug::sip::records::SIP_COMMAND_BUFFER_OFFSET;
use eudebug::{
    DebugBackend, DebugConfig, DebugSession, DeviceInfo, FakeClock, GpuMemory, GpuMemoryError,
    MemoryHandle, ThreadControlError, ThreadId, Topology,
};

pub const HANDLE: MemoryHandle = MemoryHandle(1);
pub const SSA_VA: u64 = 0x1_0000_0000;
pub const SBA_VA: u64 = 0x2_0000_0000;
pub const SLOT_SIZE: u32 = 0x400;
pub const CMD_OFFSET: u32 = 0x300;
pub const SR_OFFSET: u32 = 0x3a0;
pub const FIFO_SIZE: u32 = 56;

/// CR0 dword 1 of a thread stopped by an external halt.
pub const CR0_FORCED_HALT: u32 = 0x4000_0000;
/// CR0 dword 1 of a thread stopped on a breakpoint.
pub const CR0_BREAKPOINT: u32 = 0x8000_0000;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    });
}

/// 2 slices x 2 subslices x 2 EUs x 4 threads per tile.
pub fn device(tiles: u32) -> DeviceInfo {
    DeviceInfo::new(tiles, Topology::new(2, 2, 2, 4))
}

pub fn geometry(device: &DeviceInfo) -> ThreadGeometry {
    ThreadGeometry {
        num_slices: device.total_slices(),
        num_subslices_per_slice: device.topology.subslices_per_slice,
        num_eus_per_subslice: device.topology.eus_per_subslice,
        num_threads_per_eu: device.topology.threads_per_eu,
        state_area_offset: 0,
        state_save_size: SLOT_SIZE,
        slm_area_offset: 0,
        slm_bank_size: 0,
        slm_bank_valid: 0,
        sr_magic_offset: SR_OFFSET,
    }
}

pub fn legacy_regsets() -> LegacyRegsets {
    LegacyRegsets {
        grf: RegsetDesc::flat(0x000, 16, 256, 32),
        addr: RegsetDesc::flat(0x200, 1, 128, 16),
        flag: RegsetDesc::flat(0x210, 2, 32, 4),
        emask: RegsetDesc::flat(0x218, 1, 32, 4),
        sr: RegsetDesc::flat(0x220, 2, 128, 16),
        cr: RegsetDesc::flat(0x240, 1, 128, 16),
        tdr: RegsetDesc::flat(0x250, 1, 128, 16),
        acc: RegsetDesc::flat(0x260, 2, 256, 32),
        mme: RegsetDesc::default(),
        sp: RegsetDesc::flat(0x2a0, 1, 128, 16),
        cmd: RegsetDesc::flat(CMD_OFFSET, 1, 128, 16),
        dbg: RegsetDesc::flat(0x3c0, 1, 32, 4),
        fc: RegsetDesc::flat(0x3d0, 1, 32, 4),
    }
}

fn fifo_geometry(device: &DeviceInfo) -> FifoGeometry {
    FifoGeometry {
        offset: (geometry(device).slot_count().unwrap() * u64::from(SLOT_SIZE)) as u32,
        size: FIFO_SIZE,
        head: 0,
        tail: 0,
    }
}

pub fn legacy_header(device: &DeviceInfo, major: u8) -> StateSaveAreaHeader {
    StateSaveAreaHeader::legacy(SipVersion::new(major, 0, 0), geometry(device), legacy_regsets())
}

pub fn v3_header(device: &DeviceInfo, flags: SipFlags) -> StateSaveAreaHeader {
    v3_header_with(device, flags, legacy_regsets())
}

/// Version 3 layout with 64-byte GRFs, wide enough to carry the implicit-args pointer in r0.
pub fn wide_grf_v3_header(device: &DeviceInfo, flags: SipFlags) -> StateSaveAreaHeader {
    let mut regsets = legacy_regsets();
    regsets.grf = RegsetDesc::flat(0x000, 8, 512, 64);
    v3_header_with(device, flags, regsets)
}

fn v3_header_with(device: &DeviceInfo, flags: SipFlags, base: LegacyRegsets) -> StateSaveAreaHeader {
    StateSaveAreaHeader::v3(
        SipVersion::new(3, 0, 0),
        geometry(device),
        fifo_geometry(device),
        flags,
        V3Regsets {
            base,
            scalar: RegsetDesc::flat(0x3e0, 1, 64, 8),
            msg: RegsetDesc::flat(0x3f0, 1, 32, 4),
        },
    )
}

pub fn v5_header(device: &DeviceInfo, flags: SipFlags) -> StateSaveAreaHeader {
    let mut geometry = geometry(device);
    geometry.sr_magic_offset = 0;
    StateSaveAreaHeader::v5(SipVersion::new(5, 0, 0), geometry, fifo_geometry(device), flags)
}

/// Register map a V5 SIP publishes out of band. GRF is packed: 3 registers of 16 bytes in each
/// 64-byte row, every fourth lane unused.
#[derive(Clone, Copy, Debug, Default)]
pub struct FakeDescription {
    pub slm: bool,
}

impl FakeDescription {
    pub const GRF: RegsetDesc = RegsetDesc {
        offset: 0,
        num: 6,
        bits: 128,
        bytes: 16,
        stride: 64,
        valid_mask: 0b0111,
    };
}

impl SipDescription for FakeDescription {
    fn regset(&self, ty: RegsetType) -> Option<RegsetDesc> {
        match ty {
            RegsetType::Grf => Some(Self::GRF),
            RegsetType::Cr => Some(RegsetDesc::flat(0x240, 1, 128, 16)),
            _ => None,
        }
    }

    fn command_regset(&self) -> Option<RegsetDesc> {
        Some(RegsetDesc::flat(CMD_OFFSET, 1, 128, 16))
    }

    fn sr_counter_regset(&self) -> Option<RegsetDesc> {
        Some(RegsetDesc::flat(SR_OFFSET, 1, 32, 4))
    }

    fn supports_slm(&self) -> bool {
        self.slm
    }
}

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

pub struct FakeGpu {
    pub device: DeviceInfo,
    pub header: StateSaveAreaHeader,
    regions: Vec<Region>,
    pub ssa_va: u64,
    pub sba_va: u64,
    pub bindless: bool,
    pub debug_scratch: Option<(u64, u64)>,
    /// Interrupting one of these tiles fails.
    pub failing_interrupt_tiles: BTreeSet<u32>,
    pub fail_resume: bool,
    /// Reads overlapping `[start, end)` fail.
    pub failing_reads: Vec<(u64, u64)>,
    /// Writes overlapping `[start, end)` fail.
    pub failing_writes: Vec<(u64, u64)>,
    /// An interrupt parks every thread of the tile.
    pub park_on_interrupt: bool,
    /// The SIP ignores resumes; counters never move.
    pub sip_stuck: bool,
    /// The SIP never answers a command with `Ready`.
    pub sip_unresponsive: bool,
    pub interrupted_tiles: Vec<u32>,
    pub resumed: Vec<(u32, Vec<ThreadId>)>,
    pub reads: usize,
    pub writes: usize,
    pub slm: Vec<u8>,
    pub barrier: Vec<u8>,
}

impl FakeGpu {
    pub fn new(device: DeviceInfo, header: StateSaveAreaHeader) -> Self {
        let mut end = header.state_area_end().unwrap();
        if let Some(fifo) = header.fifo {
            end = end.max(header.header_size() + u64::from(fifo.offset) + u64::from(fifo.size) * 4);
        }
        let mut gpu = Self {
            device,
            header: header.clone(),
            regions: Vec::new(),
            ssa_va: SSA_VA,
            sba_va: 0,
            bindless: false,
            debug_scratch: None,
            failing_interrupt_tiles: BTreeSet::new(),
            fail_resume: false,
            failing_reads: Vec::new(),
            failing_writes: Vec::new(),
            park_on_interrupt: true,
            sip_stuck: false,
            sip_unresponsive: false,
            interrupted_tiles: Vec::new(),
            resumed: Vec::new(),
            reads: 0,
            writes: 0,
            slm: (0..=255u8).cycle().take(1024).collect(),
            barrier: vec![0u8; 64],
        };
        gpu.map(SSA_VA, end as usize);
        gpu.poke(SSA_VA, &header.encode_to_le_bytes());
        gpu
    }

    pub fn v3(tiles: u32) -> Self {
        let device = device(tiles);
        Self::new(device, v3_header(&device, SipFlags::empty()))
    }

    pub fn map(&mut self, base: u64, len: usize) {
        self.regions.push(Region {
            base,
            bytes: vec![0u8; len],
        });
    }

    fn locate(&self, gpu_va: u64, len: usize) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(i, region)| {
            let off = gpu_va.checked_sub(region.base)? as usize;
            (off + len <= region.bytes.len()).then_some((i, off))
        })
    }

    pub fn poke(&mut self, gpu_va: u64, data: &[u8]) {
        let (i, off) = self.locate(gpu_va, data.len()).expect("unmapped poke");
        self.regions[i].bytes[off..off + data.len()].copy_from_slice(data);
    }

    pub fn peek(&self, gpu_va: u64, len: usize) -> Vec<u8> {
        let (i, off) = self.locate(gpu_va, len).expect("unmapped peek");
        self.regions[i].bytes[off..off + len].to_vec()
    }

    pub fn poke_u32(&mut self, gpu_va: u64, value: u32) {
        self.poke(gpu_va, &value.to_le_bytes());
    }

    pub fn peek_u32(&self, gpu_va: u64) -> u32 {
        u32::from_le_bytes(self.peek(gpu_va, 4).try_into().unwrap())
    }

    pub fn slot_va(&self, id: &ThreadId) -> u64 {
        SSA_VA
            + self.header.thread_slot_offset(
                self.device.global_slice(id),
                id.subslice,
                id.eu,
                id.thread,
            )
            .unwrap()
    }

    pub fn regset_va(&self, id: &ThreadId, ty: RegsetType, index: u32) -> u64 {
        let desc = self.header.regset(ty, None).expect("regset");
        self.slot_va(id) + u64::from(desc.offset) + u64::from(index) * u64::from(desc.bytes)
    }

    pub fn set_grf_dword(&mut self, id: &ThreadId, reg: u32, dword: u32, value: u32) {
        let grf_bytes = self
            .header
            .regset(RegsetType::Grf, None)
            .map_or(32, |desc| u64::from(desc.bytes));
        let va = self.slot_va(id) + u64::from(reg) * grf_bytes + u64::from(dword) * 4;
        self.poke_u32(va, value);
    }

    pub fn set_cr0_dword1(&mut self, id: &ThreadId, value: u32) {
        let va = self.slot_va(id) + 0x240 + 4;
        self.poke_u32(va, value);
    }

    fn uses_sr_ident(&self) -> bool {
        self.header.has_sr_ident()
    }

    /// Rewrites the header in memory, leaving `self.header` as the SIP originally wrote it.
    pub fn corrupt_header(&mut self, edit: impl FnOnce(&mut StateSaveAreaHeader)) {
        let mut header = self.header.clone();
        edit(&mut header);
        let bytes = header.encode_to_le_bytes();
        self.poke(SSA_VA, &bytes);
    }

    pub fn sr_counter(&self, id: &ThreadId) -> u32 {
        let va = self.slot_va(id) + u64::from(SR_OFFSET);
        if self.uses_sr_ident() {
            u32::from(SrIdent::decode_from_le_bytes(&self.peek(va, SrIdent::SIZE_BYTES)).unwrap().count)
        } else {
            self.peek_u32(va)
        }
    }

    pub fn set_sr_counter(&mut self, id: &ThreadId, count: u32) {
        let va = self.slot_va(id) + u64::from(SR_OFFSET);
        if self.uses_sr_ident() {
            let ident = SrIdent::new(count as u8, self.header.version.version);
            self.poke(va, &ident.encode_to_le_bytes());
        } else {
            self.poke_u32(va, count);
        }
    }

    fn bump_counter(&mut self, id: &ThreadId, by: u32) {
        let next = (self.sr_counter(id) + by) & if self.uses_sr_ident() { 0xff } else { u32::MAX };
        self.set_sr_counter(id, next);
    }

    pub fn command_va(&self, id: &ThreadId) -> u64 {
        self.slot_va(id) + u64::from(CMD_OFFSET)
    }

    pub fn command(&self, id: &ThreadId) -> SipCommand {
        SipCommand::decode_from_le_bytes(&self.peek(self.command_va(id), SipCommand::SIZE_BYTES))
            .unwrap()
    }

    fn set_command(&mut self, id: &ThreadId, kind: SipCommandKind) {
        let va = self.command_va(id);
        self.poke(va, &SipCommand::new(kind, 0, 0).encode_to_le_bytes());
    }

    /// Parks a thread in the SIP the way hardware does: odd SR counter, `Ready` command block,
    /// exception reason in CR0 and a FIFO node when the layout has one.
    pub fn park(&mut self, id: &ThreadId, cr0_dword1: u32) {
        let by = if self.sr_counter(id) % 2 == 0 { 1 } else { 2 };
        self.bump_counter(id, by);
        self.set_cr0_dword1(id, cr0_dword1);
        if self.header.uses_sip_command_resume() {
            self.set_command(id, SipCommandKind::Ready);
        }
        if self.header.has_fifo() {
            self.push_fifo(id);
        }
    }

    pub fn fifo_node_va(&self, index: u32) -> u64 {
        SSA_VA + self.header.fifo_node_offset(index).unwrap()
    }

    pub fn fifo_head(&self) -> u32 {
        self.peek_u32(SSA_VA + FIFO_HEAD_OFFSET as u64)
    }

    pub fn fifo_tail(&self) -> u32 {
        self.peek_u32(SSA_VA + FIFO_TAIL_OFFSET as u64)
    }

    pub fn set_fifo_indices(&mut self, head: u32, tail: u32) {
        self.poke_u32(SSA_VA + FIFO_HEAD_OFFSET as u64, head);
        self.poke_u32(SSA_VA + FIFO_TAIL_OFFSET as u64, tail);
    }

    pub fn fifo_node_for(&self, id: &ThreadId) -> FifoNode {
        FifoNode::new(
            self.device.global_slice(id) as u8,
            id.subslice as u8,
            id.eu as u8,
            id.thread as u8,
        )
    }

    pub fn push_fifo(&mut self, id: &ThreadId) {
        let size = self.header.fifo.unwrap().size;
        let head = self.fifo_head();
        let node = self.fifo_node_for(id);
        let va = self.fifo_node_va(head);
        self.poke_u32(va, node.0);
        let tail = self.fifo_tail();
        self.set_fifo_indices((head + 1) % size, tail);
    }

    pub fn all_threads(&self, tile: u32) -> Vec<ThreadId> {
        self.device.threads_in_tile(tile, &eudebug::ThreadPattern::ALL)
    }

    fn run_sip(&mut self, id: &ThreadId) {
        if !self.header.uses_sip_command_resume() {
            if !self.sip_stuck {
                self.bump_counter(id, 1);
            }
            return;
        }
        let cmd = self.command(id);
        let staging = self.command_va(id) + SIP_COMMAND_BUFFER_OFFSET as u64;
        let (offset, size) = (cmd.offset as usize, cmd.size as usize);
        match cmd.kind() {
            Some(SipCommandKind::Resume) => {
                if !self.sip_stuck {
                    self.bump_counter(id, 1);
                }
                return;
            }
            Some(SipCommandKind::SlmRead) => {
                let data = self.slm[offset..offset + size].to_vec();
                self.poke(staging, &data);
            }
            Some(SipCommandKind::SlmWrite) => {
                let data = self.peek(staging, size);
                self.slm[offset..offset + size].copy_from_slice(&data);
            }
            Some(SipCommandKind::BarrierRead) => {
                let data = self.barrier[offset..offset + size].to_vec();
                self.poke(staging, &data);
            }
            _ => return,
        }
        if !self.sip_unresponsive {
            self.set_command(id, SipCommandKind::Ready);
        }
        // Leaves the handler for the command and parks again.
        self.bump_counter(id, 2);
    }
}

impl GpuMemory for FakeGpu {
    fn read_gpu_memory(
        &mut self,
        _handle: MemoryHandle,
        gpu_va: u64,
        buf: &mut [u8],
    ) -> Result<(), GpuMemoryError> {
        self.reads += 1;
        let end = gpu_va + buf.len() as u64;
        let failing = self
            .failing_reads
            .iter()
            .any(|(start, stop)| gpu_va < *stop && *start < end);
        let located = self.locate(gpu_va, buf.len()).filter(|_| !failing);
        let (i, off) = located.ok_or(GpuMemoryError::AccessFailed {
            gpu_va,
            len: buf.len(),
        })?;
        buf.copy_from_slice(&self.regions[i].bytes[off..off + buf.len()]);
        Ok(())
    }

    fn write_gpu_memory(
        &mut self,
        _handle: MemoryHandle,
        gpu_va: u64,
        buf: &[u8],
    ) -> Result<(), GpuMemoryError> {
        self.writes += 1;
        let end = gpu_va + buf.len() as u64;
        let failing = self
            .failing_writes
            .iter()
            .any(|(start, stop)| gpu_va < *stop && *start < end);
        let (i, off) = self
            .locate(gpu_va, buf.len())
            .filter(|_| !failing)
            .ok_or(GpuMemoryError::AccessFailed {
                gpu_va,
                len: buf.len(),
            })?;
        self.regions[i].bytes[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

impl DebugBackend for FakeGpu {
    fn default_memory_handle(&self) -> MemoryHandle {
        HANDLE
    }

    fn context_state_save_area_gpu_va(&mut self, _handle: MemoryHandle) -> u64 {
        self.ssa_va
    }

    fn sba_tracking_gpu_va(&mut self, _handle: MemoryHandle) -> u64 {
        self.sba_va
    }

    fn is_bindless_system_routine(&self) -> bool {
        self.bindless
    }

    fn debug_scratch_area(&self, _handle: MemoryHandle) -> Option<(u64, u64)> {
        self.debug_scratch
    }

    fn interrupt_tile(&mut self, tile: u32) -> Result<(), ThreadControlError> {
        if self.failing_interrupt_tiles.contains(&tile) {
            return Err(ThreadControlError::Failed { tile });
        }
        self.interrupted_tiles.push(tile);
        if self.park_on_interrupt {
            for id in self.all_threads(tile) {
                if self.sr_counter(&id) % 2 == 0 {
                    self.park(&id, CR0_FORCED_HALT);
                }
            }
        }
        Ok(())
    }

    fn resume_threads(&mut self, tile: u32, threads: &[ThreadId]) -> Result<(), ThreadControlError> {
        if self.fail_resume {
            return Err(ThreadControlError::Failed { tile });
        }
        self.resumed.push((tile, threads.to_vec()));
        for id in threads {
            self.run_sip(id);
        }
        Ok(())
    }
}

/// Short waits so timeouts resolve in a handful of polls.
pub fn test_config() -> DebugConfig {
    DebugConfig {
        fifo_poll_interval_ms: 0,
        resume_confirm_max_polls: 4,
        sip_command_max_retries: 4,
        ..DebugConfig::default()
    }
}

pub fn session(gpu: FakeGpu) -> (DebugSession<FakeGpu>, FakeClock) {
    init_tracing();
    let clock = FakeClock::new();
    let device = gpu.device;
    let session = DebugSession::new(gpu, device, test_config()).with_clock(clock.clone());
    (session, clock)
}

/// Parks `id` on a breakpoint and lets the session discover and report it.
pub fn stop_on_breakpoint(session: &mut DebugSession<FakeGpu>, id: &ThreadId) {
    session.backend_mut().park(id, CR0_BREAKPOINT);
    if !session.backend().header.has_fifo() {
        session
            .handle_attention_event(id.tile, HANDLE, std::slice::from_ref(id))
            .unwrap();
    } else {
        session.tick().unwrap();
    }
    assert!(session.thread(id).unwrap().is_stopped(), "{id} did not stop");
}

/// Delivers every queued event.
pub fn drain_events(session: &mut DebugSession<FakeGpu>) -> Vec<eudebug::DebugEvent> {
    let mut out = Vec::new();
    while session.pending_event_count() > 0 {
        out.push(session.read_event(std::time::Duration::ZERO).unwrap());
    }
    out
}
