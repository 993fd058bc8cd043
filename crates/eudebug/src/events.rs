//! Debugger-visible events.

use std::collections::VecDeque;

use serde::Serialize;

use crate::topology::ThreadPattern;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebugEvent {
    /// A thread stopped and its state may be inspected.
    ThreadStopped {
        thread: ThreadPattern,
        page_fault: bool,
    },
    /// An interrupt request could not be completed for these threads.
    ThreadUnavailable { thread: ThreadPattern },
}

impl DebugEvent {
    pub fn thread(&self) -> &ThreadPattern {
        match self {
            DebugEvent::ThreadStopped { thread, .. } | DebugEvent::ThreadUnavailable { thread } => {
                thread
            }
        }
    }
}

/// Strict FIFO of undelivered events.
#[derive(Clone, Debug, Default)]
pub struct EventQueue {
    events: VecDeque<DebugEvent>,
}

impl EventQueue {
    pub fn push(&mut self, event: DebugEvent) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<DebugEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DebugEvent> {
        self.events.iter()
    }
}
