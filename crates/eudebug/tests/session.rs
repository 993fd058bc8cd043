mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::*;
use eudebug::{
    Clock, DebugConfig, DebugEvent, DebugSession, ErrorKind, FakeClock, ThreadId, ThreadPattern,
};
use pretty_assertions::assert_eq;
use serde_json::json;

#[test]
fn read_event_times_out_when_nothing_happens() {
    let (mut session, clock) = session(FakeGpu::v3(1));
    let err = session.read_event(Duration::from_millis(5)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);
    assert!(clock.now() >= Duration::from_millis(5));
    assert!(clock.now() < Duration::from_millis(7));
}

#[test]
fn read_event_picks_up_stops_while_waiting() {
    let (mut session, _) = session(FakeGpu::v3(1));
    let id = ThreadId::new(0, 1, 1, 0, 0);
    session.backend_mut().park(&id, CR0_BREAKPOINT);

    let event = session.read_event(Duration::from_millis(1)).unwrap();
    assert_eq!(
        event,
        DebugEvent::ThreadStopped {
            thread: ThreadPattern::new(1, 1, 0, 0),
            page_fault: false,
        }
    );
    assert!(session.thread(&id).unwrap().is_reported_stopped());
}

#[test]
fn tile_attach_and_detach() {
    let (mut session, _) = session(FakeGpu::v3(2));
    assert!(session.is_tile_attached(0) && session.is_tile_attached(1));

    session.detach_tile(1).unwrap();
    assert!(!session.is_tile_attached(1));
    assert_eq!(session.detach_tile(1).unwrap_err().kind(), ErrorKind::NotAvailable);
    assert!(!session.are_all_tile_sessions_detached());

    session.detach_tile(0).unwrap();
    assert!(session.are_all_tile_sessions_detached());

    session.attach_tile(0).unwrap();
    assert_eq!(session.attach_tile(0).unwrap_err().kind(), ErrorKind::NotAvailable);
    assert_eq!(session.attach_tile(2).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(session.tile(0).unwrap().registry().len(), 16);
}

#[test]
fn reattached_tile_starts_with_running_threads() {
    let (mut session, _) = session(FakeGpu::v3(1));
    let id = ThreadId::new(0, 0, 0, 0, 1);
    stop_on_breakpoint(&mut session, &id);

    session.detach_tile(0).unwrap();
    session.attach_tile(0).unwrap();
    assert!(session.thread(&id).unwrap().is_running());
}

#[test]
fn missing_state_save_area_is_unknown() {
    let mut gpu = FakeGpu::v3(1);
    gpu.ssa_va = 0;
    let (mut session, _) = session(gpu);
    let err = session.get_register_set_properties().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
}

#[test]
fn invalid_state_save_area_is_not_reread() {
    let mut gpu = FakeGpu::v3(1);
    gpu.poke(SSA_VA, b"garbage!");
    let (mut session, _) = session(gpu);

    let err = session.get_register_set_properties().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAvailable);
    let reads = session.backend().reads;

    let err = session.get_register_set_properties().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAvailable);
    assert_eq!(session.backend().reads, reads);
}

#[test]
fn unsupported_major_version_is_rejected() {
    let device = device(1);
    let mut header = v3_header(&device, Default::default());
    header.version.version.major = 9;
    let gpu = FakeGpu::new(device, header);
    let (mut session, _) = session(gpu);
    assert_eq!(
        session.get_register_set_properties().unwrap_err().kind(),
        ErrorKind::NotAvailable
    );
}

#[test]
fn header_is_dumped_once() {
    let dir = tempfile::Builder::new()
        .prefix("eudebug-dump")
        .tempdir()
        .unwrap();
    let path = dir.path().join("surface.bin");
    let config = DebugConfig {
        dump_debug_surface_file: Some(path.clone()),
        ..test_config()
    };

    let mut gpu = FakeGpu::v3(1);
    let expected = gpu.header.encode_to_le_bytes();
    const SECOND_SSA_VA: u64 = 0x4_0000_0000;
    gpu.map(SECOND_SSA_VA, expected.len());
    gpu.poke(SECOND_SSA_VA, &expected);
    let device = gpu.device;
    let mut session = DebugSession::new(gpu, device, config).with_clock(FakeClock::new());

    session.get_register_set_properties().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), expected);

    std::fs::remove_file(&path).unwrap();
    session.backend_mut().ssa_va = SECOND_SSA_VA;
    session.get_register_set_properties().unwrap();
    assert!(!path.exists());
}

#[test]
fn events_serialize_with_a_type_tag() {
    let event = DebugEvent::ThreadStopped {
        thread: ThreadPattern::new(1, 0, 2, 3),
        page_fault: true,
    };
    assert_eq!(
        serde_json::to_value(event).unwrap(),
        json!({
            "type": "thread_stopped",
            "thread": { "slice": 1, "subslice": 0, "eu": 2, "thread": 3 },
            "page_fault": true,
        })
    );
    let event = DebugEvent::ThreadUnavailable {
        thread: ThreadPattern::ALL,
    };
    assert_eq!(
        serde_json::to_value(event).unwrap()["type"],
        json!("thread_unavailable")
    );
}

#[test]
fn config_from_json_keeps_defaults() {
    let config: DebugConfig =
        serde_json::from_value(json!({ "interrupt_timeout_ms": 25, "resume_confirm_max_polls": 3 }))
            .unwrap();
    assert_eq!(
        config,
        DebugConfig {
            interrupt_timeout_ms: 25,
            resume_confirm_max_polls: 3,
            ..DebugConfig::default()
        }
    );
}

#[test]
fn config_from_environment_overrides() {
    let vars: HashMap<&str, &str> = [
        ("EUDEBUG_FIFO_POLL_INTERVAL_MS", "5"),
        ("EUDEBUG_SIP_COMMAND_MAX_RETRIES", " 7 "),
        ("EUDEBUG_INTERRUPT_TIMEOUT_MS", "soon"),
        ("EUDEBUG_ENABLE_PID_FD_FOR_IPC", "1"),
        ("EUDEBUG_DUMP_DEBUG_SURFACE_FILE", "/tmp/ssa.bin"),
    ]
    .into_iter()
    .collect();
    let config = DebugConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(config.fifo_poll_interval_ms, 5);
    assert_eq!(config.sip_command_max_retries, 7);
    assert_eq!(config.interrupt_timeout_ms, DebugConfig::default().interrupt_timeout_ms);
    assert!(config.enable_pid_fd_for_ipc);
    assert_eq!(
        config.dump_debug_surface_file.as_deref(),
        Some(std::path::Path::new("/tmp/ssa.bin"))
    );
}

#[test]
fn queued_events_are_visible_before_delivery() {
    let (mut session, _) = session(FakeGpu::v3(1));
    let id = ThreadId::new(0, 0, 1, 1, 1);
    stop_on_breakpoint(&mut session, &id);

    let queued: Vec<_> = session.events().iter().copied().collect();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].thread(), &ThreadPattern::new(0, 1, 1, 1));
    assert!(!session.thread(&id).unwrap().is_reported_stopped());

    assert_eq!(drain_events(&mut session), queued);
    assert!(session.thread(&id).unwrap().is_reported_stopped());
}

#[test]
fn corrupt_slot_geometry_is_unknown() {
    let edits: [fn(&mut eudebug::sip::ThreadGeometry); 4] = [
        |g| {
            g.num_slices = u32::MAX;
            g.num_subslices_per_slice = u32::MAX;
            g.num_eus_per_subslice = u32::MAX;
            g.state_save_size = u32::MAX;
        },
        |g| g.num_threads_per_eu = 64,
        |g| g.state_save_size = u32::MAX,
        |g| g.sr_magic_offset = SLOT_SIZE - 8,
    ];
    for (i, edit) in edits.into_iter().enumerate() {
        let (mut session, _) = session(FakeGpu::v3(1));
        session
            .backend_mut()
            .corrupt_header(|header| edit(&mut header.geometry));

        session.tick().unwrap();
        let err = session.get_register_set_properties().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown, "edit {i}");
        assert!(session.stopped_threads(&ThreadPattern::ALL).is_empty(), "edit {i}");
    }
}
