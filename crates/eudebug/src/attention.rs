//! Discovery of threads that newly raised attention.
//!
//! Layouts before V3 are polled thread by thread through the SR ident marker. Later layouts
//! carry an attention FIFO that the SIP fills with one node per stopped thread; draining it reads
//! the span from tail to head, invalidates the consumed nodes and publishes `tail = head`.

use std::time::Duration;

use eudebug_sip::fifo::FIFO_NODE_SIZE;
use eudebug_sip::format::{FIFO_HEAD_OFFSET, FIFO_TAIL_OFFSET};
use eudebug_sip::FifoNode;
use tracing::{debug, trace, warn};

use crate::backend::{DebugBackend, GpuMemory, MemoryHandle};
use crate::error::{DebugError, Result};
use crate::session::DebugSession;
use crate::topology::ThreadId;

/// Drain rounds per call; each round re-reads head and tail.
const MAX_FIFO_DRAIN_ROUNDS: usize = 8;

#[derive(Debug, Default)]
pub(crate) struct AttentionState {
    pub(crate) newly_stopped: Vec<ThreadId>,
    pub(crate) last_fifo_drain: Option<Duration>,
}

impl<B: DebugBackend> DebugSession<B> {
    /// Threads confirmed stopped since events were last generated.
    pub fn newly_stopped_threads(&self) -> &[ThreadId] {
        &self.attention.newly_stopped
    }

    /// Records `id` as newly stopped if its SR counter shows a fresh stop.
    ///
    /// Returns whether the thread was added. A thread whose marker was never written, or whose
    /// counter cannot be read, is treated as not stopped.
    pub fn add_thread_to_newly_stopped_from_raised_attention(
        &mut self,
        id: &ThreadId,
        handle: MemoryHandle,
    ) -> Result<bool> {
        match self.thread(id) {
            None => {
                warn!(thread = %id, "attention raised for unknown thread");
                return Ok(false);
            }
            Some(thread) if thread.is_stopped() => return Ok(false),
            Some(_) => {}
        }

        let (ssa_va, header) = self.state_save_area(handle)?;
        let counter = match self.read_sr_counter(id, handle, ssa_va, &header) {
            Ok(Some(counter)) => counter,
            Ok(None) => {
                trace!(thread = %id, "sr ident not written");
                return Ok(false);
            }
            Err(err) => {
                debug!(thread = %id, %err, "failed to read sr counter");
                return Ok(false);
            }
        };

        let Some(thread) = self.thread_mut(id) else {
            return Ok(false);
        };
        if !thread.verify_stopped(counter) {
            trace!(thread = %id, counter, "thread not stopped");
            return Ok(false);
        }
        thread.stop(handle);
        self.attention.newly_stopped.push(*id);
        debug!(thread = %id, counter, "thread newly stopped");
        Ok(true)
    }

    /// Drains the attention FIFO and returns the threads it named, oldest first.
    ///
    /// Layouts without a FIFO yield nothing. Nodes that stay invalid after the settle retries
    /// are dropped as read races. Any failed write aborts the drain.
    pub fn read_fifo(&mut self, handle: MemoryHandle) -> Result<Vec<ThreadId>> {
        let (ssa_va, header) = self.state_save_area(handle)?;
        let Some(fifo) = header.fifo.filter(|_| header.has_fifo()) else {
            return Ok(Vec::new());
        };
        if fifo.size == 0 {
            return Ok(Vec::new());
        }
        let nodes_va = ssa_va + header.header_size() + u64::from(fifo.offset);
        let head_va = ssa_va + FIFO_HEAD_OFFSET as u64;
        let tail_va = ssa_va + FIFO_TAIL_OFFSET as u64;

        let mut threads = Vec::new();
        for _ in 0..MAX_FIFO_DRAIN_ROUNDS {
            let head = self.backend.read_u32(handle, head_va)?;
            let tail = self.backend.read_u32(handle, tail_va)?;
            if head >= fifo.size || tail >= fifo.size {
                warn!(head, tail, size = fifo.size, "attention fifo indices out of range");
                return Err(DebugError::Unknown("attention fifo indices out of range"));
            }
            if head == tail {
                break;
            }

            let spans = if tail < head {
                vec![(tail, head)]
            } else {
                vec![(tail, fifo.size), (0, head)]
            };
            let mut consumed = 0usize;
            for (start, end) in spans.into_iter().filter(|(s, e)| s < e) {
                let span_va = nodes_va + u64::from(start) * FIFO_NODE_SIZE as u64;
                let mut raw = vec![0u8; (end - start) as usize * FIFO_NODE_SIZE];
                self.backend.read_gpu_memory(handle, span_va, &mut raw)?;

                for (i, chunk) in raw.chunks_exact(FIFO_NODE_SIZE).enumerate() {
                    let node_va = span_va + (i * FIFO_NODE_SIZE) as u64;
                    let mut node = FifoNode::decode_from_le_bytes(chunk).unwrap_or_default();
                    if !node.valid() {
                        node = self.reread_fifo_node(handle, node_va)?;
                    }
                    if !node.valid() {
                        warn!(index = start as usize + i, "invalid attention fifo node skipped");
                        continue;
                    }
                    match self
                        .device
                        .from_global(node.slice(), node.subslice(), node.eu(), node.thread())
                    {
                        Some(id) => threads.push(id),
                        None => warn!(raw = node.0, "attention fifo node names no thread"),
                    }
                    consumed += 1;
                }

                self.backend
                    .write_gpu_memory(handle, span_va, &vec![0u8; raw.len()])?;
            }

            self.backend.write_u32(handle, tail_va, head)?;
            debug!(head, tail, consumed, "drained attention fifo");
        }
        Ok(threads)
    }

    /// Re-reads an invalid node after settle delays, bounded by the configured retry timeout.
    fn reread_fifo_node(&mut self, handle: MemoryHandle, node_va: u64) -> Result<FifoNode> {
        let settle = self.config.fifo_read_settle_delay();
        let attempts = (self.config.fifo_read_retry_timeout().as_micros()
            / settle.as_micros().max(1))
        .max(1);
        let mut node = FifoNode::INVALID;
        for _ in 0..attempts {
            self.clock.sleep(settle);
            node = FifoNode(self.backend.read_u32(handle, node_va)?);
            if node.valid() {
                break;
            }
        }
        Ok(node)
    }

    /// Drains the FIFO and records every thread it confirms stopped.
    ///
    /// Without `force`, drains closer together than the configured poll interval are skipped.
    /// Returns the number of threads added.
    pub fn poll_fifo(&mut self, handle: MemoryHandle, force: bool) -> Result<usize> {
        let now = self.clock.now();
        if !force {
            if let Some(last) = self.attention.last_fifo_drain {
                if now.saturating_sub(last) < self.config.fifo_poll_interval() {
                    return Ok(0);
                }
            }
        }
        let threads = self.read_fifo(handle)?;
        self.attention.last_fifo_drain = Some(now);
        let mut added = 0;
        for id in threads {
            if !self.is_tile_attached(id.tile) {
                continue;
            }
            if self.add_thread_to_newly_stopped_from_raised_attention(&id, handle)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Tick-driven discovery.
    pub(crate) fn poll_attention(&mut self) -> Result<()> {
        let handle = self.backend.default_memory_handle();
        let header = match self.state_save_area(handle) {
            Ok((_, header)) => header,
            Err(err) => {
                trace!(%err, "no state save area to poll");
                return Ok(());
            }
        };

        let before = self.attention.newly_stopped.len();
        if header.has_fifo() {
            self.poll_fifo(handle, false)?;
        } else if self.interrupts.sent {
            let candidates: Vec<ThreadId> = self
                .interrupts
                .pending
                .iter()
                .flat_map(|p| self.device.threads_in_tile(p.tile, &p.pattern))
                .filter(|id| self.thread(id).is_some_and(|t| !t.is_stopped()))
                .collect();
            for id in candidates {
                let handle = self.thread_handle(&id);
                self.add_thread_to_newly_stopped_from_raised_attention(&id, handle)?;
            }
        }

        let mut tiles: Vec<u32> = self.attention.newly_stopped[before..]
            .iter()
            .map(|id| id.tile)
            .collect();
        tiles.sort_unstable();
        tiles.dedup();
        for tile in tiles {
            self.new_attention_raised(tile);
        }
        self.trigger_events_for_unsolicited_stops();
        Ok(())
    }
}
