//! Per-slot runtime state of every hardware thread.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::backend::MemoryHandle;
use crate::topology::{DeviceInfo, ThreadId, ThreadPattern};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Stopped,
    /// A resume was issued and the SR counter has not been seen to move yet.
    ConfirmPending,
}

#[derive(Clone, Debug)]
pub struct EuThread {
    id: ThreadId,
    state: ThreadState,
    reported_stopped: bool,
    last_counter: u32,
    memory_handle: Option<MemoryHandle>,
    page_fault: bool,
}

impl EuThread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            state: ThreadState::Running,
            reported_stopped: false,
            last_counter: 0,
            memory_handle: None,
            page_fault: false,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ThreadState::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.state == ThreadState::Running
    }

    pub fn is_reported_stopped(&self) -> bool {
        self.reported_stopped
    }

    pub fn last_counter(&self) -> u32 {
        self.last_counter
    }

    pub fn memory_handle(&self) -> Option<MemoryHandle> {
        self.memory_handle
    }

    pub fn has_page_fault(&self) -> bool {
        self.page_fault
    }

    pub fn set_page_fault(&mut self) {
        self.page_fault = true;
    }

    /// Checks an SR counter read from the slot.
    ///
    /// The SIP bumps the counter on every stop and every resume, so the thread is parked when the
    /// counter is odd. Returns `true` when `counter` shows a stop not yet recorded here.
    pub fn verify_stopped(&mut self, counter: u32) -> bool {
        if counter % 2 == 0 {
            return false;
        }
        if counter == self.last_counter {
            return false;
        }
        let delta = counter.wrapping_sub(self.last_counter) & 0xff;
        if delta > 2 {
            debug!(thread = %self.id, last = self.last_counter, counter, "sr counter out of sync");
        }
        self.last_counter = counter;
        true
    }

    /// Marks the thread stopped in the context identified by `handle`.
    pub fn stop(&mut self, handle: MemoryHandle) {
        if self.state == ThreadState::Stopped {
            warn!(thread = %self.id, "thread already stopped");
        }
        self.state = ThreadState::Stopped;
        self.memory_handle = Some(handle);
    }

    pub fn report_as_stopped(&mut self) {
        if self.state == ThreadState::Stopped {
            self.reported_stopped = true;
        }
    }

    pub fn begin_resume(&mut self) {
        self.state = ThreadState::ConfirmPending;
        self.reported_stopped = false;
        self.page_fault = false;
    }

    /// Completes a resume. A thread that is already running stays running.
    pub fn confirm_resumed(&mut self, counter: Option<u32>) {
        if self.state == ThreadState::Stopped {
            return;
        }
        // An odd counter means the thread already parked again; keep the stop detectable.
        if let Some(counter) = counter {
            self.last_counter = counter & !1;
        }
        self.state = ThreadState::Running;
    }

    /// Records a counter change caused by the SIP servicing a command while parked.
    pub fn update_counter(&mut self, counter: u32) {
        self.last_counter = counter;
    }
}

/// All thread slots of one tile.
#[derive(Clone, Debug, Default)]
pub struct EuThreadRegistry {
    threads: BTreeMap<ThreadId, EuThread>,
}

impl EuThreadRegistry {
    pub fn for_tile(device: &DeviceInfo, tile: u32) -> Self {
        let threads = device
            .threads_in_tile(tile, &ThreadPattern::ALL)
            .into_iter()
            .map(|id| (id, EuThread::new(id)))
            .collect();
        Self { threads }
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn get(&self, id: &ThreadId) -> Option<&EuThread> {
        self.threads.get(id)
    }

    pub fn get_mut(&mut self, id: &ThreadId) -> Option<&mut EuThread> {
        self.threads.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EuThread> {
        self.threads.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EuThread> {
        self.threads.values_mut()
    }

    fn matching<'a>(
        &'a self,
        device: &'a DeviceInfo,
        pattern: &'a ThreadPattern,
    ) -> impl Iterator<Item = &'a EuThread> + 'a {
        self.threads
            .values()
            .filter(move |t| pattern.contains(&device.to_api(&t.id)))
    }

    /// Threads matched by `pattern` that are not stopped.
    pub fn not_stopped_threads(&self, device: &DeviceInfo, pattern: &ThreadPattern) -> Vec<ThreadId> {
        self.matching(device, pattern)
            .filter(|t| !t.is_stopped())
            .map(|t| t.id)
            .collect()
    }

    pub fn stopped_threads(&self, device: &DeviceInfo, pattern: &ThreadPattern) -> Vec<ThreadId> {
        self.matching(device, pattern)
            .filter(|t| t.is_stopped())
            .map(|t| t.id)
            .collect()
    }

    /// `true` when every thread matched by `pattern` is stopped.
    pub fn are_requested_threads_stopped(&self, device: &DeviceInfo, pattern: &ThreadPattern) -> bool {
        self.matching(device, pattern).all(|t| t.is_stopped())
    }
}
