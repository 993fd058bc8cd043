//! Interrupt requests, their dispatch to the hardware and their resolution into events.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use eudebug_sip::RegsetType;
use tracing::{debug, info, warn};

use crate::backend::DebugBackend;
use crate::error::{DebugError, Result};
use crate::events::DebugEvent;
use crate::session::DebugSession;
use crate::topology::{ThreadId, ThreadPattern};

/// Force-exception and force-external-halt bits of control register dword 1.
const CR0_FORCED_EXCEPTION_MASK: u32 = 0x4400_0000;
const CR0_EXCEPTION_MASK: u32 = 0xfc00_0000;

/// `true` when the only exception reasons in `cr0_dword1` are the ones an interrupt raises.
pub fn is_force_exception_or_force_external_halt_only(cr0_dword1: u32) -> bool {
    cr0_dword1 & CR0_EXCEPTION_MASK & !CR0_FORCED_EXCEPTION_MASK == 0
}

/// An interrupt request for the threads of one tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingInterrupt {
    pub tile: u32,
    pub pattern: ThreadPattern,
    /// A matching thread was seen stopped.
    pub completed: bool,
}

#[derive(Debug)]
pub(crate) struct InterruptState {
    pub(crate) queue: VecDeque<PendingInterrupt>,
    pub(crate) pending: Vec<PendingInterrupt>,
    pub(crate) sent: bool,
    pub(crate) sent_at: Duration,
    pub(crate) trigger_events: bool,
    pub(crate) expected_attention: Vec<u32>,
}

impl InterruptState {
    pub(crate) fn new(tiles: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            pending: Vec::new(),
            sent: false,
            sent_at: Duration::ZERO,
            trigger_events: false,
            expected_attention: vec![0; tiles as usize],
        }
    }

    fn overlaps(&self, pattern: &ThreadPattern) -> bool {
        self.queue
            .iter()
            .chain(self.pending.iter())
            .any(|req| req.pattern.overlaps(pattern))
    }

    pub(crate) fn forget_tile(&mut self, tile: u32) {
        self.queue.retain(|req| req.tile != tile);
        self.pending.retain(|req| req.tile != tile);
        if let Some(expected) = self.expected_attention.get_mut(tile as usize) {
            *expected = 0;
        }
        if self.pending.is_empty() {
            self.sent = false;
            self.trigger_events = false;
        }
    }
}

impl<B: DebugBackend> DebugSession<B> {
    /// Queues an interrupt for the threads matched by `pattern`.
    ///
    /// The hardware is interrupted on the next [`DebugSession::tick`]; completion is reported as
    /// events.
    pub fn interrupt(&mut self, pattern: ThreadPattern) -> Result<()> {
        let tiles = self.attached_tiles_of(&pattern)?;
        if self.are_requested_threads_stopped(&pattern) {
            return Err(DebugError::NotAvailable("requested threads are already stopped"));
        }
        if self.interrupts.overlaps(&pattern) {
            return Err(DebugError::NotReady("an interrupt for these threads is pending"));
        }
        for tile in tiles {
            let running = self.tiles[tile as usize]
                .registry()
                .not_stopped_threads(&self.device, &pattern);
            if running.is_empty() {
                continue;
            }
            self.interrupts.queue.push_back(PendingInterrupt {
                tile,
                pattern,
                completed: false,
            });
        }
        debug!(thread = %pattern, queued = self.interrupts.queue.len(), "interrupt queued");
        Ok(())
    }

    /// Interrupts every tile with queued requests, unless a previous batch is still in flight.
    ///
    /// A tile whose interrupt fails has its requests reported unavailable immediately.
    pub fn send_interrupts(&mut self) {
        if self.interrupts.sent || self.interrupts.queue.is_empty() {
            return;
        }
        let batch: Vec<PendingInterrupt> = self.interrupts.queue.drain(..).collect();
        let tiles: BTreeSet<u32> = batch.iter().map(|req| req.tile).collect();

        let mut failed = BTreeSet::new();
        for tile in tiles {
            match self.backend.interrupt_tile(tile) {
                Ok(()) => {
                    self.interrupts.expected_attention[tile as usize] += 1;
                    info!(tile, "interrupt sent");
                }
                Err(err) => {
                    warn!(tile, %err, "interrupt failed");
                    failed.insert(tile);
                }
            }
        }

        let mut unavailable = Vec::new();
        for req in batch {
            if failed.contains(&req.tile) {
                unavailable.push(req.pattern);
            } else {
                self.interrupts.pending.push(req);
            }
        }
        self.push_unavailable_events(unavailable);

        if !self.interrupts.pending.is_empty() {
            self.interrupts.sent = true;
            self.interrupts.sent_at = self.clock.now();
        }
    }

    /// Accounts for one attention event on `tile`.
    pub fn new_attention_raised(&mut self, tile: u32) {
        if let Some(expected) = self.interrupts.expected_attention.get_mut(tile as usize) {
            *expected = expected.saturating_sub(1);
        }
        if self.interrupts.sent && self.expected_attention_events() == 0 {
            self.interrupts.trigger_events = true;
        }
    }

    pub fn expected_attention_events(&self) -> u32 {
        self.interrupts.expected_attention.iter().sum()
    }

    pub fn pending_interrupts(&self) -> &[PendingInterrupt] {
        &self.interrupts.pending
    }

    pub fn queued_interrupt_count(&self) -> usize {
        self.interrupts.queue.len()
    }

    pub fn is_interrupt_sent(&self) -> bool {
        self.interrupts.sent
    }

    /// Stops with no interrupt in flight are reported (or resumed) right away.
    pub(crate) fn trigger_events_for_unsolicited_stops(&mut self) {
        if !self.interrupts.sent && !self.attention.newly_stopped.is_empty() {
            self.interrupts.trigger_events = true;
        }
    }

    /// Marks pending interrupts matching `id` completed; returns whether any matched.
    fn complete_pending_interrupts(&mut self, id: &ThreadId) -> bool {
        let api = self.device.to_api(id);
        let mut matched = false;
        for req in self
            .interrupts
            .pending
            .iter_mut()
            .filter(|req| req.tile == id.tile && req.pattern.contains(&api))
        {
            req.completed = true;
            matched = true;
        }
        matched
    }

    fn stop_is_interrupt_only(&mut self, id: &ThreadId) -> bool {
        match self.read_register_raw(id, RegsetType::Cr, 0) {
            Ok(cr0) if cr0.len() >= 8 => {
                let dword1 = u32::from_le_bytes([cr0[4], cr0[5], cr0[6], cr0[7]]);
                is_force_exception_or_force_external_halt_only(dword1)
            }
            Ok(_) => false,
            Err(err) => {
                debug!(thread = %id, %err, "cannot read exception reason");
                false
            }
        }
    }

    /// Splits the newly stopped threads into threads to report and threads to resume.
    fn fill_resume_and_stopped_threads_from_newly_stopped(
        &mut self,
    ) -> (Vec<ThreadId>, Vec<ThreadId>) {
        let newly = std::mem::take(&mut self.attention.newly_stopped);
        let mut resume = Vec::new();
        let mut report = Vec::new();
        for id in newly {
            let Some(thread) = self.thread(&id) else {
                continue;
            };
            if !thread.is_stopped() {
                continue;
            }
            let page_fault = thread.has_page_fault();
            let interrupted = self.complete_pending_interrupts(&id);
            if page_fault || interrupted || !self.stop_is_interrupt_only(&id) {
                report.push(id);
            } else {
                debug!(thread = %id, "thread stopped without a pending interrupt");
                resume.push(id);
            }
        }
        (resume, report)
    }

    fn generate_events_for_stopped_threads(&mut self, threads: &[ThreadId]) {
        for id in threads {
            let page_fault = self.thread(id).is_some_and(|t| t.has_page_fault());
            self.events.push(DebugEvent::ThreadStopped {
                thread: self.device.to_api(id),
                page_fault,
            });
        }
    }

    fn generate_events_for_pending_interrupts(&mut self) {
        let pending = std::mem::take(&mut self.interrupts.pending);
        let unavailable = pending
            .into_iter()
            .filter(|req| !req.completed)
            .map(|req| req.pattern)
            .collect();
        self.push_unavailable_events(unavailable);
        self.interrupts.expected_attention.iter_mut().for_each(|e| *e = 0);
    }

    /// One unavailable event per distinct pattern.
    fn push_unavailable_events(&mut self, mut patterns: Vec<ThreadPattern>) {
        let mut seen = Vec::new();
        patterns.retain(|p| {
            if seen.contains(p) {
                false
            } else {
                seen.push(*p);
                true
            }
        });
        for thread in patterns {
            warn!(%thread, "threads unavailable");
            self.events.push(DebugEvent::ThreadUnavailable { thread });
        }
    }

    /// Resolves the current interrupt batch once its attention arrived or it timed out.
    pub fn generate_events_and_resume_stopped_threads(&mut self) -> Result<()> {
        if self.interrupts.sent && !self.interrupts.trigger_events {
            let elapsed = self.clock.now().saturating_sub(self.interrupts.sent_at);
            if elapsed >= self.config.interrupt_timeout() {
                warn!(?elapsed, "interrupt timed out");
                self.interrupts.trigger_events = true;
            }
        }
        if !self.interrupts.trigger_events {
            return Ok(());
        }

        let (resume, report) = self.fill_resume_and_stopped_threads_from_newly_stopped();
        self.resume_accidentally_stopped_threads(&resume);
        self.generate_events_for_stopped_threads(&report);
        self.generate_events_for_pending_interrupts();

        self.interrupts.sent = false;
        self.interrupts.trigger_events = false;
        Ok(())
    }
}
