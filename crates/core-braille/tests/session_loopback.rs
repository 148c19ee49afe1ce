//! End-to-end session behavior over the loopback endpoint.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use core_braille::{
    ACK, BrailleSession, DotTable, KeyEventHook, SessionConfig, SessionTimings, encode_frame, msg,
    parse_frame, report,
};
use core_commands::{Command, basic};
use core_keytable::{
    KeyBinding, KeyCombination, KeyTableDef, KeyTableRuntime, KeyTableTimings, KeyValue, group,
};
use core_reports::ReportBus;
use core_sched::Scheduler;
use core_transport::{LoopbackEndpoint, LoopbackHandle};

struct Harness {
    sched: Rc<Scheduler>,
    session: Rc<BrailleSession>,
    wire: LoopbackHandle,
    commands: Rc<RefCell<Vec<Command>>>,
}

fn harness() -> Harness {
    let sched = Rc::new(Scheduler::new().expect("scheduler"));
    let bus = Rc::new(ReportBus::new());
    let commands = Rc::new(RefCell::new(Vec::new()));

    let mut builder = KeyTableDef::builder();
    let ctx = builder.context("default", None);
    builder.bind(
        ctx,
        KeyBinding::new(
            KeyCombination::solo(KeyValue::new(group::NAV, 2)),
            Command::basic(basic::LNDN),
        ),
    );
    builder.default_context(ctx);
    let sink = Rc::clone(&commands);
    let keytable = KeyTableRuntime::new(
        Rc::clone(&sched),
        Rc::new(builder.build()),
        KeyTableTimings::default(),
        move |cmd| sink.borrow_mut().push(cmd),
    );

    let (endpoint, wire) = LoopbackEndpoint::pair();
    let session = BrailleSession::new(
        Rc::clone(&sched),
        Box::new(endpoint),
        keytable,
        bus,
        SessionConfig {
            driver_name: "loopback",
            columns: 40,
            rows: 1,
            status_cells: 0,
            dot_table: DotTable::identity(),
            timings: SessionTimings {
                ack_timeout: Duration::from_millis(100),
                ack_limit: 3,
                read_subsequent: Duration::from_millis(1),
            },
        },
    );
    Harness {
        sched,
        session,
        wire,
        commands,
    }
}

fn sent_frames(wire: &LoopbackHandle) -> Vec<Vec<u8>> {
    let bytes = wire.take_output();
    let mut frames = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        assert_eq!(bytes[i], 0x01, "frame must start with SOH");
        let mut end = i + 1;
        while bytes[end] != 0x04 {
            end += 1;
        }
        let frame = parse_frame(&bytes[i..=end]).expect("well-formed frame on the wire");
        frames.push(frame.payload);
        i = end + 1;
    }
    frames
}

#[test]
fn key_event_frame_reaches_the_command_queue() {
    let h = harness();
    // NAV group, key number 2, pressed.
    h.wire
        .inject(&encode_frame(&[report::KEY_EVENT, group::NAV, 0, 2, 1], 0));
    h.session.pump_input();
    assert_eq!(*h.commands.borrow(), vec![Command::basic(basic::LNDN)]);
    h.wire
        .inject(&encode_frame(&[report::KEY_EVENT, group::NAV, 0, 2, 0], 1));
    h.session.pump_input();
    assert_eq!(h.commands.borrow().len(), 1);
}

#[test]
fn cell_writes_transmit_only_after_acknowledgement() {
    let h = harness();
    h.session.write_cells(&[0x11; 40], None);
    let frames = sent_frames(&h.wire);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][0], msg::TEXT_CELLS);
    assert_eq!(frames[0][1], 0, "first write covers offset zero");

    // Unacknowledged: further writes queue instead of transmitting.
    h.session.write_cells(&[0x22; 40], None);
    h.session.write_cells(&[0x33; 40], None);
    assert!(sent_frames(&h.wire).is_empty());

    h.wire.inject(&[ACK]);
    h.session.pump_input();
    let frames = sent_frames(&h.wire);
    assert_eq!(frames.len(), 1, "burst coalesced to the newest cells");
    assert!(frames[0][2..].iter().all(|c| *c == 0x33));
}

#[test]
fn repeated_ack_timeouts_mark_the_session_failed() {
    let h = harness();
    h.session.write_cells(&[0xFF; 40], None);
    assert!(
        h.sched
            .await_condition(Duration::from_secs(2), || h.session.has_failed())
    );
}

#[test]
fn api_hook_consumes_keys_before_the_key_table() {
    struct Grab {
        grabbed: Rc<RefCell<Vec<(u8, u16, bool)>>>,
    }
    impl KeyEventHook for Grab {
        fn handle_key_event(&self, key: KeyValue, pressed: bool) -> bool {
            self.grabbed.borrow_mut().push((key.group, key.number, pressed));
            true
        }
    }

    let h = harness();
    let grabbed = Rc::new(RefCell::new(Vec::new()));
    h.session.set_key_event_hook(Some(Rc::new(Grab {
        grabbed: Rc::clone(&grabbed),
    })));
    h.wire
        .inject(&encode_frame(&[report::KEY_EVENT, group::NAV, 0, 2, 1], 0));
    h.session.pump_input();
    assert_eq!(*grabbed.borrow(), vec![(group::NAV, 2, true)]);
    assert!(h.commands.borrow().is_empty());
}

#[test]
fn updated_key_sets_press_ascending_and_release_descending() {
    let h = harness();
    let seen = Rc::new(RefCell::new(Vec::new()));
    struct Log {
        seen: Rc<RefCell<Vec<(u16, bool)>>>,
    }
    impl KeyEventHook for Log {
        fn handle_key_event(&self, key: KeyValue, pressed: bool) -> bool {
            self.seen.borrow_mut().push((key.number, pressed));
            true
        }
    }
    h.session.set_key_event_hook(Some(Rc::new(Log {
        seen: Rc::clone(&seen),
    })));

    h.session.enqueue_updated_keys(group::NAV, 0b0110);
    h.session.enqueue_updated_keys(group::NAV, 0b1000);
    assert_eq!(
        *seen.borrow(),
        vec![(1, true), (2, true), (3, true), (2, false), (1, false)]
    );
}

#[test]
fn momentary_chords_press_all_then_release_in_reverse() {
    let h = harness();
    let seen = Rc::new(RefCell::new(Vec::new()));
    struct Log {
        seen: Rc<RefCell<Vec<(u16, bool)>>>,
    }
    impl KeyEventHook for Log {
        fn handle_key_event(&self, key: KeyValue, pressed: bool) -> bool {
            self.seen.borrow_mut().push((key.number, pressed));
            true
        }
    }
    h.session.set_key_event_hook(Some(Rc::new(Log {
        seen: Rc::clone(&seen),
    })));

    h.session.enqueue_keys(group::NAV, 0b101);
    assert_eq!(
        *seen.borrow(),
        vec![(0, true), (2, true), (2, false), (0, false)]
    );
}

#[test]
fn suspended_session_refuses_cell_writes() {
    let h = harness();
    h.session.suspend();
    h.session.write_cells(&[0x55; 40], None);
    assert!(sent_frames(&h.wire).is_empty());
    h.session.resume();
    h.session.write_cells(&[0x55; 40], None);
    assert_eq!(sent_frames(&h.wire).len(), 1);
}

#[test]
fn raw_mode_bypasses_the_session_entirely() {
    let h = harness();
    let raw = Rc::new(RefCell::new(Vec::new()));
    {
        let raw = Rc::clone(&raw);
        h.session
            .set_raw_sink(Some(Box::new(move |payload: &[u8]| {
                raw.borrow_mut().push(payload.to_vec());
            })));
    }
    // Device frames land in the raw sink, not the key table.
    h.wire
        .inject(&encode_frame(&[report::KEY_EVENT, group::NAV, 0, 2, 1], 0));
    h.session.pump_input();
    assert!(h.commands.borrow().is_empty());
    assert_eq!(raw.borrow().len(), 1);

    // Client packets go straight to the device.
    h.session.send_raw_packet(&[0x7A, 0x01]).expect("write");
    let frames = sent_frames(&h.wire);
    assert_eq!(frames, vec![vec![0x7A, 0x01]]);
}
