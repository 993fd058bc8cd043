//! Root debug session: owns the per-tile thread registries and drives the polling tick.

use std::sync::Arc;

use eudebug_sip::{SipDescription, SrIdent, StateSaveAreaHeader};
use tracing::{debug, info, trace, warn};

use crate::attention::AttentionState;
use crate::backend::{DebugBackend, GpuMemory, MemoryHandle};
use crate::clock::{Clock, StdClock};
use crate::config::DebugConfig;
use crate::error::{DebugError, Result};
use crate::events::{DebugEvent, EventQueue};
use crate::interrupt::InterruptState;
use crate::ssa::StateSaveAreaCache;
use crate::thread::{EuThread, EuThreadRegistry};
use crate::topology::{DeviceInfo, ThreadId, ThreadPattern};

/// Largest thread slot accepted from a state save area header.
const MAX_THREAD_SLOT_BYTES: u32 = 1 << 20;
/// Attention FIFO nodes accepted per device thread.
const MAX_FIFO_NODES_PER_THREAD: u64 = 2;

/// Debug sub-session of one tile.
#[derive(Debug)]
pub struct TileSession {
    index: u32,
    attached: bool,
    registry: EuThreadRegistry,
}

impl TileSession {
    fn new(device: &DeviceInfo, index: u32) -> Self {
        Self {
            index,
            attached: true,
            registry: EuThreadRegistry::for_tile(device, index),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn registry(&self) -> &EuThreadRegistry {
        &self.registry
    }
}

pub struct DebugSession<B: DebugBackend> {
    pub(crate) backend: B,
    pub(crate) device: DeviceInfo,
    pub(crate) config: DebugConfig,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) sip_description: Option<Box<dyn SipDescription>>,
    pub(crate) tiles: Vec<TileSession>,
    pub(crate) ssa_cache: StateSaveAreaCache,
    pub(crate) interrupts: InterruptState,
    pub(crate) attention: AttentionState,
    pub(crate) events: EventQueue,
}

impl<B: DebugBackend> DebugSession<B> {
    /// Creates a session with every tile attached and every thread running.
    pub fn new(backend: B, device: DeviceInfo, config: DebugConfig) -> Self {
        let tiles = (0..device.tiles)
            .map(|index| TileSession::new(&device, index))
            .collect();
        info!(
            tiles = device.tiles,
            slices = device.topology.slices_per_tile,
            subslices = device.topology.subslices_per_slice,
            eus = device.topology.eus_per_subslice,
            threads = device.topology.threads_per_eu,
            "debug session created"
        );
        Self {
            backend,
            device,
            config,
            clock: Box::new(StdClock::new()),
            sip_description: None,
            tiles,
            ssa_cache: StateSaveAreaCache::new(),
            interrupts: InterruptState::new(device.tiles),
            attention: AttentionState::default(),
            events: EventQueue::default(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_sip_description(mut self, description: impl SipDescription + 'static) -> Self {
        self.sip_description = Some(Box::new(description));
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    pub fn tile(&self, tile: u32) -> Option<&TileSession> {
        self.tiles.get(tile as usize)
    }

    pub fn thread(&self, id: &ThreadId) -> Option<&EuThread> {
        self.tiles.get(id.tile as usize)?.registry.get(id)
    }

    pub(crate) fn thread_mut(&mut self, id: &ThreadId) -> Option<&mut EuThread> {
        self.tiles.get_mut(id.tile as usize)?.registry.get_mut(id)
    }

    pub(crate) fn description(&self) -> Option<&dyn SipDescription> {
        self.sip_description.as_deref()
    }

    /// Attaches a tile sub-session, recreating its thread registry.
    pub fn attach_tile(&mut self, tile: u32) -> Result<()> {
        let device = self.device;
        let session = self
            .tiles
            .get_mut(tile as usize)
            .ok_or(DebugError::InvalidArgument("no such tile"))?;
        if session.attached {
            return Err(DebugError::NotAvailable("tile is already attached"));
        }
        session.registry = EuThreadRegistry::for_tile(&device, tile);
        session.attached = true;
        debug!(tile, "tile attached");
        Ok(())
    }

    pub fn detach_tile(&mut self, tile: u32) -> Result<()> {
        let session = self
            .tiles
            .get_mut(tile as usize)
            .ok_or(DebugError::InvalidArgument("no such tile"))?;
        if !session.attached {
            return Err(DebugError::NotAvailable("tile is not attached"));
        }
        session.attached = false;
        self.interrupts.forget_tile(tile);
        debug!(tile, "tile detached");
        Ok(())
    }

    pub fn is_tile_attached(&self, tile: u32) -> bool {
        self.tile(tile).is_some_and(|t| t.attached)
    }

    pub fn are_all_tile_sessions_detached(&self) -> bool {
        self.tiles.iter().all(|t| !t.attached)
    }

    /// Attached tiles a pattern can touch. Naming a detached tile explicitly is an error.
    pub(crate) fn attached_tiles_of(&self, pattern: &ThreadPattern) -> Result<Vec<u32>> {
        self.device.validate(pattern)?;
        let tiles = self.device.tiles_of(pattern);
        let attached: Vec<u32> = tiles
            .iter()
            .copied()
            .filter(|tile| self.is_tile_attached(*tile))
            .collect();
        if attached.is_empty() {
            return Err(DebugError::NotAvailable("tile is not attached"));
        }
        Ok(attached)
    }

    /// `true` when every thread matched by `pattern` on attached tiles is stopped.
    pub fn are_requested_threads_stopped(&self, pattern: &ThreadPattern) -> bool {
        self.tiles
            .iter()
            .filter(|t| t.attached)
            .all(|t| t.registry.are_requested_threads_stopped(&self.device, pattern))
    }

    pub fn not_stopped_threads(&self, pattern: &ThreadPattern) -> Vec<ThreadId> {
        self.tiles
            .iter()
            .filter(|t| t.attached)
            .flat_map(|t| t.registry.not_stopped_threads(&self.device, pattern))
            .collect()
    }

    pub fn stopped_threads(&self, pattern: &ThreadPattern) -> Vec<ThreadId> {
        self.tiles
            .iter()
            .filter(|t| t.attached)
            .flat_map(|t| t.registry.stopped_threads(&self.device, pattern))
            .collect()
    }

    /// Resolves a single-thread pattern to a stopped thread on an attached tile.
    pub(crate) fn stopped_thread(&self, pattern: &ThreadPattern) -> Result<ThreadId> {
        let id = self.device.to_physical(pattern)?;
        if !self.is_tile_attached(id.tile) {
            return Err(DebugError::NotAvailable("tile is not attached"));
        }
        match self.thread(&id) {
            Some(thread) if thread.is_stopped() => Ok(id),
            Some(_) => Err(DebugError::NotAvailable("thread is not stopped")),
            None => Err(DebugError::InvalidArgument("thread is outside the device topology")),
        }
    }

    /// Memory handle a thread was stopped in, falling back to the attached context.
    pub(crate) fn thread_handle(&self, id: &ThreadId) -> MemoryHandle {
        self.thread(id)
            .and_then(|t| t.memory_handle())
            .unwrap_or_else(|| self.backend.default_memory_handle())
    }

    /// GPU VA and parsed header of the state-save area of the context behind `handle`.
    pub(crate) fn state_save_area(
        &mut self,
        handle: MemoryHandle,
    ) -> Result<(u64, Arc<StateSaveAreaHeader>)> {
        let gpu_va = self.backend.context_state_save_area_gpu_va(handle);
        if gpu_va == 0 {
            return Err(DebugError::Unknown(
                "context state save area address is unavailable",
            ));
        }
        let header = self.ssa_cache.get_or_load(
            &mut self.backend,
            handle,
            gpu_va,
            self.config.dump_debug_surface_file.as_deref(),
        )?;
        self.check_header_geometry(&header)?;
        Ok((gpu_va, header))
    }

    /// Rejects a header whose slot area or FIFO cannot belong to this device.
    fn check_header_geometry(&self, header: &StateSaveAreaHeader) -> Result<()> {
        header.validate_geometry()?;
        let threads = self.device.total_threads();
        let slots = header.geometry.slot_count().unwrap_or(u64::MAX);
        if slots > threads {
            warn!(slots, threads, "state save area has more slots than the device has threads");
            return Err(DebugError::Unknown("state save area geometry exceeds the device"));
        }
        if header.geometry.state_save_size > MAX_THREAD_SLOT_BYTES {
            warn!(size = header.geometry.state_save_size, "thread slot size out of range");
            return Err(DebugError::Unknown("thread slot size is out of range"));
        }
        if let Some(fifo) = header.fifo.filter(|_| header.has_fifo()) {
            if u64::from(fifo.size) > threads.saturating_mul(MAX_FIFO_NODES_PER_THREAD) {
                warn!(size = fifo.size, threads, "attention fifo larger than the device");
                return Err(DebugError::Unknown("attention fifo size is out of range"));
            }
        }
        Ok(())
    }

    /// GPU VA of a thread's slot.
    pub(crate) fn slot_gpu_va(
        &self,
        ssa_va: u64,
        header: &StateSaveAreaHeader,
        id: &ThreadId,
    ) -> Result<u64> {
        let offset = header
            .thread_slot_offset(self.device.global_slice(id), id.subslice, id.eu, id.thread)
            .ok_or(DebugError::Unknown("thread is outside the state save area"))?;
        Ok(ssa_va + offset)
    }

    fn sr_ident_gpu_va(
        &self,
        ssa_va: u64,
        header: &StateSaveAreaHeader,
        id: &ThreadId,
    ) -> Result<u64> {
        let offset = header
            .sr_magic_offset(self.device.global_slice(id), id.subslice, id.eu, id.thread)
            .ok_or(DebugError::Unknown("thread is outside the state save area"))?;
        Ok(ssa_va + offset)
    }

    /// Fails unless the thread's SR ident carries the SIP magic. Layouts without the marker
    /// always pass.
    pub(crate) fn check_slot_ident(
        &mut self,
        id: &ThreadId,
        handle: MemoryHandle,
        ssa_va: u64,
        header: &StateSaveAreaHeader,
    ) -> Result<()> {
        if !header.has_sr_ident() {
            return Ok(());
        }
        let va = self.sr_ident_gpu_va(ssa_va, header, id)?;
        let mut raw = [0u8; SrIdent::SIZE_BYTES];
        self.backend.read_gpu_memory(handle, va, &mut raw)?;
        match SrIdent::decode_from_le_bytes(&raw) {
            Some(ident) if ident.is_valid() => Ok(()),
            _ => {
                warn!(thread = %id, "thread slot sr ident is corrupt");
                Err(DebugError::Unknown("thread slot sr ident is corrupt"))
            }
        }
    }

    /// Reads the SIP's per-thread stop counter.
    ///
    /// `Ok(None)` means the slot carries no valid marker (never written by the SIP).
    pub(crate) fn read_sr_counter(
        &mut self,
        id: &ThreadId,
        handle: MemoryHandle,
        ssa_va: u64,
        header: &StateSaveAreaHeader,
    ) -> Result<Option<u32>> {
        if header.has_sr_ident() {
            let va = self.sr_ident_gpu_va(ssa_va, header, id)?;
            let mut raw = [0u8; SrIdent::SIZE_BYTES];
            self.backend.read_gpu_memory(handle, va, &mut raw)?;
            return Ok(sr_ident_counter(&raw));
        }
        let desc = header
            .sr_counter_regset(self.description())
            .ok_or(DebugError::UnsupportedFeature("sip exposes no sr counter"))?;
        let va = self.slot_gpu_va(ssa_va, header, id)? + u64::from(desc.offset);
        Ok(Some(self.backend.read_u32(handle, va)?))
    }

    /// Same as [`Self::read_sr_counter`], from a snapshot of the thread area.
    ///
    /// `snapshot` starts at the first thread slot.
    pub(crate) fn sr_counter_from_snapshot(
        &self,
        id: &ThreadId,
        header: &StateSaveAreaHeader,
        snapshot: &[u8],
    ) -> Option<u32> {
        let slice = self.device.global_slice(id);
        let offset = header
            .sr_magic_offset(slice, id.subslice, id.eu, id.thread)?
            .checked_sub(header.state_area_start())?;
        let offset = usize::try_from(offset).ok()?;
        sr_ident_counter(snapshot.get(offset..offset.checked_add(SrIdent::SIZE_BYTES)?)?)
    }

    /// One step of the driver's debug loop.
    ///
    /// Sends queued interrupts, discovers newly stopped threads and turns them into events,
    /// resuming threads that stopped without a reason the debugger asked about.
    pub fn tick(&mut self) -> Result<()> {
        self.send_interrupts();
        self.poll_attention()?;
        self.generate_events_and_resume_stopped_threads()
    }

    /// Driver notification that threads of `tile` raised attention in the context `handle`.
    ///
    /// `candidates` are the threads the driver saw in the attention bitmask; layouts with an
    /// attention FIFO ignore them and drain the FIFO instead.
    pub fn handle_attention_event(
        &mut self,
        tile: u32,
        handle: MemoryHandle,
        candidates: &[ThreadId],
    ) -> Result<()> {
        if !self.is_tile_attached(tile) {
            return Err(DebugError::NotAvailable("tile is not attached"));
        }
        self.new_attention_raised(tile);
        let (_, header) = self.state_save_area(handle)?;
        if header.has_fifo() {
            self.poll_fifo(handle, true)?;
        } else {
            for id in candidates.iter().filter(|id| id.tile == tile) {
                self.add_thread_to_newly_stopped_from_raised_attention(id, handle)?;
            }
        }
        self.trigger_events_for_unsolicited_stops();
        self.generate_events_and_resume_stopped_threads()
    }

    /// Driver notification that `threads` stopped on a page fault.
    ///
    /// Faulting threads are always reported, never resumed behind the debugger's back.
    pub fn handle_page_fault_event(
        &mut self,
        tile: u32,
        handle: MemoryHandle,
        threads: &[ThreadId],
    ) -> Result<()> {
        if !self.is_tile_attached(tile) {
            return Err(DebugError::NotAvailable("tile is not attached"));
        }
        for id in threads.iter().filter(|id| id.tile == tile) {
            if self.add_thread_to_newly_stopped_from_raised_attention(id, handle)? {
                if let Some(thread) = self.thread_mut(id) {
                    thread.set_page_fault();
                }
            } else if let Some(thread) = self.thread_mut(id) {
                trace!(thread = %id, "page fault reported for thread not newly stopped");
                if thread.is_stopped() && !thread.is_reported_stopped() {
                    thread.set_page_fault();
                }
            }
        }
        self.trigger_events_for_unsolicited_stops();
        self.generate_events_and_resume_stopped_threads()
    }

    /// Delivers the oldest event, polling for up to `timeout` if none is queued.
    ///
    /// Delivering a stop marks the thread as reported, which makes it eligible for resume.
    pub fn read_event(&mut self, timeout: std::time::Duration) -> Result<DebugEvent> {
        let deadline = self.clock.now() + timeout;
        loop {
            if let Some(event) = self.events.pop() {
                self.mark_delivered(&event);
                return Ok(event);
            }
            self.tick()?;
            if let Some(event) = self.events.pop() {
                self.mark_delivered(&event);
                return Ok(event);
            }
            if self.clock.now() >= deadline {
                return Err(DebugError::NotReady("no event available"));
            }
            self.clock.sleep(self.config.read_event_poll_interval());
        }
    }

    pub fn pending_event_count(&self) -> usize {
        self.events.len()
    }

    /// Undelivered events, oldest first.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    fn mark_delivered(&mut self, event: &DebugEvent) {
        if let DebugEvent::ThreadStopped { thread, .. } = event {
            for id in self.device.single_threads(thread) {
                if let Some(t) = self.thread_mut(&id) {
                    t.report_as_stopped();
                }
            }
        }
    }
}

fn sr_ident_counter(raw: &[u8]) -> Option<u32> {
    let ident = SrIdent::decode_from_le_bytes(raw)?;
    if ident.is_zeroed() || !ident.is_valid() {
        return None;
    }
    Some(u32::from(ident.count))
}
