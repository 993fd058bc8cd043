mod common;

use std::time::Duration;

use common::*;
use eudebug::{DebugEvent, ErrorKind, ThreadId, ThreadPattern, WILDCARD};
use pretty_assertions::assert_eq;

fn events(session: &eudebug::DebugSession<FakeGpu>) -> Vec<DebugEvent> {
    session.events().iter().copied().collect()
}

#[test]
fn failed_interrupt_reports_thread_unavailable() {
    let mut gpu = FakeGpu::v3(1);
    gpu.failing_interrupt_tiles.insert(0);
    let (mut session, _) = session(gpu);
    let pattern = ThreadPattern::new(0, 0, 0, 1);

    session.interrupt(pattern).unwrap();
    session.send_interrupts();

    assert_eq!(
        events(&session),
        vec![DebugEvent::ThreadUnavailable { thread: pattern }]
    );
    assert!(session.pending_interrupts().is_empty());
    assert!(!session.is_interrupt_sent());
    assert_eq!(session.expected_attention_events(), 0);
}

#[test]
fn wildcard_interrupt_hits_every_tile_once() {
    let mut gpu = FakeGpu::v3(2);
    gpu.park_on_interrupt = false;
    let (mut session, _) = session(gpu);

    session.interrupt(ThreadPattern::ALL).unwrap();
    assert_eq!(session.queued_interrupt_count(), 2);
    session.send_interrupts();

    assert_eq!(session.backend().interrupted_tiles, vec![0, 1]);
    assert_eq!(session.expected_attention_events(), 2);
    assert_eq!(session.pending_interrupts().len(), 2);
    assert!(session.is_interrupt_sent());

    // A second send while the batch is in flight does nothing.
    session.send_interrupts();
    assert_eq!(session.backend().interrupted_tiles.len(), 2);
}

#[test]
fn interrupt_timeout_reports_one_unavailable_event() {
    let mut gpu = FakeGpu::v3(1);
    gpu.park_on_interrupt = false;
    let (mut session, clock) = session(gpu);

    session.interrupt(ThreadPattern::ALL).unwrap();
    session.tick().unwrap();
    assert!(events(&session).is_empty());
    assert!(session.is_interrupt_sent());

    clock.advance(Duration::from_millis(1999));
    session.tick().unwrap();
    assert!(events(&session).is_empty());

    clock.advance(Duration::from_millis(1));
    session.tick().unwrap();
    assert_eq!(
        events(&session),
        vec![DebugEvent::ThreadUnavailable {
            thread: ThreadPattern::ALL
        }]
    );
    assert!(!session.is_interrupt_sent());
    assert!(session.pending_interrupts().is_empty());
    assert_eq!(session.expected_attention_events(), 0);

    session.tick().unwrap();
    assert_eq!(session.pending_event_count(), 1);
}

#[test]
fn single_thread_interrupt_resumes_bystanders() {
    let (mut session, _) = session(FakeGpu::v3(1));
    let target = ThreadId::new(0, 0, 0, 0, 1);

    session.interrupt(ThreadPattern::new(0, 0, 0, 1)).unwrap();
    session.tick().unwrap();

    assert_eq!(
        events(&session),
        vec![DebugEvent::ThreadStopped {
            thread: ThreadPattern::new(0, 0, 0, 1),
            page_fault: false,
        }]
    );
    assert!(session.thread(&target).unwrap().is_stopped());
    let gpu_threads = session.backend().all_threads(0);
    for id in gpu_threads.iter().filter(|id| **id != target) {
        assert!(session.thread(id).unwrap().is_running(), "{id} left stopped");
    }
    let resumed: Vec<ThreadId> = session
        .backend()
        .resumed
        .iter()
        .flat_map(|(_, threads)| threads.iter().copied())
        .collect();
    assert_eq!(resumed.len(), gpu_threads.len() - 1);
    assert!(!resumed.contains(&target));
}

#[test]
fn interrupt_all_reports_every_thread() {
    let (mut session, _) = session(FakeGpu::v3(2));
    session.interrupt(ThreadPattern::ALL).unwrap();
    session.tick().unwrap();

    assert_eq!(session.pending_event_count(), 32);
    assert!(session
        .events()
        .iter()
        .all(|e| matches!(e, DebugEvent::ThreadStopped { page_fault: false, .. })));
    assert!(session.are_requested_threads_stopped(&ThreadPattern::ALL));
    assert!(session.not_stopped_threads(&ThreadPattern::ALL).is_empty());
    assert_eq!(session.expected_attention_events(), 0);
    assert!(session.pending_interrupts().is_empty());
}

#[test]
fn overlapping_interrupt_is_not_ready() {
    let (mut session, _) = session(FakeGpu::v3(1));
    session.interrupt(ThreadPattern::new(0, 1, WILDCARD, WILDCARD)).unwrap();

    let err = session.interrupt(ThreadPattern::new(0, 1, 1, 2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);
    let err = session.interrupt(ThreadPattern::ALL).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);

    session.interrupt(ThreadPattern::new(0, 0, 1, 2)).unwrap();
    assert_eq!(session.queued_interrupt_count(), 2);
}

#[test]
fn interrupting_stopped_threads_is_not_available() {
    let (mut session, _) = session(FakeGpu::v3(1));
    let id = ThreadId::new(0, 0, 0, 0, 3);
    stop_on_breakpoint(&mut session, &id);

    let err = session.interrupt(ThreadPattern::new(0, 0, 0, 3)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAvailable);
}

#[test]
fn interrupt_outside_topology_is_invalid() {
    let (mut session, _) = session(FakeGpu::v3(1));
    let err = session.interrupt(ThreadPattern::new(2, 0, 0, 0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = session.interrupt(ThreadPattern::new(0, 0, 0, 4)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn unsolicited_breakpoint_is_reported() {
    let (mut session, _) = session(FakeGpu::v3(1));
    let id = ThreadId::new(0, 1, 1, 0, 0);
    stop_on_breakpoint(&mut session, &id);

    assert_eq!(
        events(&session),
        vec![DebugEvent::ThreadStopped {
            thread: ThreadPattern::new(1, 1, 0, 0),
            page_fault: false,
        }]
    );
    assert!(session.backend().resumed.is_empty());
}

#[test]
fn unsolicited_forced_halt_is_resumed() {
    let (mut session, _) = session(FakeGpu::v3(1));
    let id = ThreadId::new(0, 1, 1, 0, 0);
    session.backend_mut().park(&id, CR0_FORCED_HALT);
    session.tick().unwrap();

    assert!(events(&session).is_empty());
    assert!(session.thread(&id).unwrap().is_running());
    assert_eq!(session.backend().resumed, vec![(0, vec![id])]);
}

#[test]
fn failed_tile_does_not_block_other_tiles() {
    let mut gpu = FakeGpu::v3(2);
    gpu.failing_interrupt_tiles.insert(1);
    let (mut session, _) = session(gpu);

    session.interrupt(ThreadPattern::ALL).unwrap();
    session.tick().unwrap();

    let events = events(&session);
    assert_eq!(
        events[0],
        DebugEvent::ThreadUnavailable {
            thread: ThreadPattern::ALL
        }
    );
    assert_eq!(events.len(), 1 + 16);
    let slice = |s| ThreadPattern::new(s, WILDCARD, WILDCARD, WILDCARD);
    assert!(session.are_requested_threads_stopped(&slice(0)));
    assert!(!session.are_requested_threads_stopped(&slice(2)));
}
