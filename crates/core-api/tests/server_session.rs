//! Full client sessions against a live server over a Unix socket.
//!
//! The scheduler thread runs the server; the client side runs on a plain
//! blocking socket in a helper thread and reports its observations back
//! through a channel.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use core_api::{
    ApiServer, HostSpec, KeyRange, Packet, WriteRequest, cell_for_char, encode_key_ranges,
    encode_tty_path, kind,
};
use core_braille::{ACK, BrailleSession, DotTable, SessionConfig, SessionTimings, msg, parse_frame};
use core_commands::{Command, basic};
use core_keytable::{
    KeyBinding, KeyCombination, KeyTableDef, KeyTableRuntime, KeyTableTimings, KeyValue, group,
};
use core_reports::ReportBus;
use core_sched::Scheduler;
use core_transport::{LoopbackEndpoint, LoopbackHandle};

struct Fixture {
    sched: Rc<Scheduler>,
    display: Rc<BrailleSession>,
    server: ApiServer,
    wire: LoopbackHandle,
    socket: PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let sched = Rc::new(Scheduler::new().expect("scheduler"));
    let bus = Rc::new(ReportBus::new());

    let mut builder = KeyTableDef::builder();
    let ctx = builder.context("default", None);
    builder.bind(
        ctx,
        KeyBinding::new(
            KeyCombination::solo(KeyValue::new(group::NAV, 1)),
            Command::basic(basic::LNUP),
        ),
    );
    builder.default_context(ctx);
    let keytable = KeyTableRuntime::new(
        Rc::clone(&sched),
        Rc::new(builder.build()),
        KeyTableTimings::default(),
        |_| {},
    );

    let (endpoint, wire) = LoopbackEndpoint::pair();
    let display = BrailleSession::new(
        Rc::clone(&sched),
        Box::new(endpoint),
        keytable,
        Rc::clone(&bus),
        SessionConfig {
            driver_name: "loopback",
            columns: 40,
            rows: 1,
            status_cells: 0,
            dot_table: DotTable::identity(),
            timings: SessionTimings {
                ack_timeout: Duration::from_secs(10),
                ack_limit: 3,
                read_subsequent: Duration::from_millis(1),
            },
        },
    );

    let server = ApiServer::new(Rc::clone(&sched), Rc::clone(&display), bus, "").expect("server");
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("api");
    server
        .listen(&HostSpec::Local {
            path: socket.clone(),
        })
        .expect("listen");

    Fixture {
        sched,
        display,
        server,
        wire,
        socket,
        _dir: dir,
    }
}

// --- blocking client helpers ---------------------------------------------

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

fn read_packet(stream: &mut UnixStream) -> Packet {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).expect("packet header");
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).expect("packet payload");
    Packet::new(kind, payload)
}

fn write_packet(stream: &mut UnixStream, kind: u32, payload: &[u8]) {
    stream
        .write_all(&Packet::new(kind, payload.to_vec()).encode())
        .expect("packet write");
}

fn handshake(stream: &mut UnixStream) {
    let version = read_packet(stream);
    assert_eq!(version.kind, kind::VERSION);
    write_packet(stream, kind::VERSION, &version.payload);
    write_packet(stream, kind::AUTH, b"");
    let ack = read_packet(stream);
    assert_eq!(ack.kind, kind::ACK, "auth should be acknowledged");
}

/// Run `client` on a helper thread while the scheduler pumps until `done`.
fn drive<T: Send + 'static>(
    fixture: &Fixture,
    client: impl FnOnce(UnixStream) -> T + Send + 'static,
) -> T {
    let socket = fixture.socket.clone();
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        let stream = UnixStream::connect(socket).expect("connect");
        let result = client(stream);
        flag.store(true, Ordering::SeqCst);
        tx.send(result).expect("result channel");
    });
    assert!(
        fixture
            .sched
            .await_condition(Duration::from_secs(10), || done.load(Ordering::SeqCst)),
        "client thread did not finish in time"
    );
    thread.join().expect("client thread");
    rx.recv().expect("client result")
}

#[test]
fn handshake_then_display_size_query() {
    let fixture = fixture();
    let (columns, rows) = drive(&fixture, |mut stream| {
        handshake(&mut stream);
        write_packet(&mut stream, kind::GET_DISPLAY_SIZE, b"");
        let reply = read_packet(&mut stream);
        assert_eq!(reply.kind, kind::GET_DISPLAY_SIZE);
        let columns = u32::from_be_bytes(reply.payload[0..4].try_into().unwrap());
        let rows = u32::from_be_bytes(reply.payload[4..8].try_into().unwrap());
        (columns, rows)
    });
    assert_eq!((columns, rows), (40, 1));
    // Session is gone once the stream drops.
    assert!(
        fixture
            .sched
            .await_condition(Duration::from_secs(5), || fixture.server.client_count() == 0)
    );
}

#[test]
fn write_before_tty_mode_is_an_invalid_state_error() {
    let fixture = fixture();
    let error_kind = drive(&fixture, |mut stream| {
        handshake(&mut stream);
        let request = WriteRequest {
            text: Some("hi".into()),
            ..WriteRequest::default()
        };
        write_packet(&mut stream, kind::WRITE, &request.encode());
        read_packet(&mut stream).kind
    });
    assert_eq!(error_kind, kind::ERROR);
}

#[test]
fn focused_tty_client_drives_the_display() {
    let fixture = fixture();
    drive(&fixture, |mut stream| {
        handshake(&mut stream);
        write_packet(&mut stream, kind::ENTER_TTY_MODE, &encode_tty_path(&[1]));
        assert_eq!(read_packet(&mut stream).kind, kind::ACK);
        write_packet(&mut stream, kind::SET_FOCUS, &encode_tty_path(&[1]));
        let request = WriteRequest {
            region_begin: Some(1),
            region_size: Some(5),
            text: Some("hello".into()),
            cursor: Some(1),
            ..WriteRequest::default()
        };
        write_packet(&mut stream, kind::WRITE, &request.encode());
        assert_eq!(read_packet(&mut stream).kind, kind::ACK);
    });
    // The display transmitted a text-cells frame for the region.
    assert!(fixture.wire.output_len() > 0, "no cells reached the device");
}

#[test]
fn mask_only_write_modifies_existing_cells_and_keeps_cursor() {
    let fixture = fixture();
    drive(&fixture, |mut stream| {
        handshake(&mut stream);
        write_packet(&mut stream, kind::ENTER_TTY_MODE, &encode_tty_path(&[1]));
        assert_eq!(read_packet(&mut stream).kind, kind::ACK);
        write_packet(&mut stream, kind::SET_FOCUS, &encode_tty_path(&[1]));

        let text = WriteRequest {
            region_begin: Some(1),
            region_size: Some(4),
            text: Some("ab".into()),
            cursor: Some(2),
            ..WriteRequest::default()
        };
        write_packet(&mut stream, kind::WRITE, &text.encode());
        assert_eq!(read_packet(&mut stream).kind, kind::ACK);

        // No text, no cursor: the masks rework the cells already written,
        // and the stored cursor must survive.
        let masks = WriteRequest {
            region_begin: Some(1),
            region_size: Some(2),
            and_mask: Some(vec![0x0F, 0x0F]),
            or_mask: Some(vec![0x80, 0x80]),
            ..WriteRequest::default()
        };
        write_packet(&mut stream, kind::WRITE, &masks.encode());
        assert_eq!(read_packet(&mut stream).kind, kind::ACK);
    });

    // First transmission: the text write, cursor dots overlaid on cell 1.
    let cursor_dots = 0b1100_0000u8;
    let first = sent_frames(&fixture.wire);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0][0], msg::TEXT_CELLS);
    assert_eq!(first[0][2], cell_for_char('a'));
    assert_eq!(first[0][3], cell_for_char('b') | cursor_dots);

    // Acknowledge it so the queued masked update reaches the wire.
    fixture.wire.inject(&[ACK]);
    fixture.display.pump_input();
    let second = sent_frames(&fixture.wire);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0][0], msg::TEXT_CELLS);
    let cells = &second[0][2..];
    assert_eq!(cells[0], (cell_for_char('a') & 0x0F) | 0x80);
    assert_eq!(
        cells[1],
        ((cell_for_char('b') & 0x0F) | 0x80) | cursor_dots,
        "cursor from the first write must still overlay cell 1"
    );
    assert!(cells[2..].iter().all(|c| *c == 0));
}

#[test]
fn accepted_key_ranges_route_keys_to_the_client() {
    let fixture = fixture();
    let display = Rc::clone(&fixture.display);

    // Accept only driver keys of the NAV group (type|group in the high
    // bits); the low 16 bits (key number) are don't-care.
    let nav_base = core_api::KEY_TYPE_DRIVER | ((group::NAV as u64) << 16);
    let ranges = [KeyRange {
        first: nav_base,
        last: nav_base | 0xFFFF,
        mask: 0xFFFF,
    }];
    let ranges = encode_key_ranges(&ranges);

    // A periodic alarm on the scheduler thread deposits the key event once
    // the client thread has armed its ranges.
    let armed = Arc::new(AtomicBool::new(false));
    {
        let armed = Arc::clone(&armed);
        let injected = std::cell::Cell::new(false);
        let handle = fixture.sched.set_alarm_in(Duration::from_millis(10), move |_| {
            if armed.load(Ordering::SeqCst) && !injected.get() {
                injected.set(true);
                display.enqueue_key_event(KeyValue::new(group::NAV, 1), true);
            }
        });
        fixture
            .sched
            .set_alarm_interval(handle, Some(Duration::from_millis(10)));
    }

    let trigger = Arc::clone(&armed);
    let key_code = drive(&fixture, move |mut stream| {
        handshake(&mut stream);
        write_packet(&mut stream, kind::ENTER_TTY_MODE, &encode_tty_path(&[4]));
        assert_eq!(read_packet(&mut stream).kind, kind::ACK);
        write_packet(&mut stream, kind::SET_FOCUS, &encode_tty_path(&[4]));
        write_packet(&mut stream, kind::ACCEPT_KEY_RANGES, &ranges);
        assert_eq!(read_packet(&mut stream).kind, kind::ACK);
        trigger.store(true, Ordering::SeqCst);
        let key = read_packet(&mut stream);
        assert_eq!(key.kind, kind::KEY);
        core_api::decode_key_code(&key.payload).expect("key code")
    });

    assert_eq!(key_code & 0xFFFF, 1, "key number survives");
    assert_eq!(
        key_code & core_api::KEY_TYPE_DRIVER,
        core_api::KEY_TYPE_DRIVER
    );
}
