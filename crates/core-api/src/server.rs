//! The client/server front end.
//!
//! One `ApiServer` accepts stream connections (Unix socket or TCP), runs the
//! session handshake (Version, then Auth), and multiplexes display writes,
//! raw-mode packets, parameters, and key delivery across clients. Everything
//! runs on the scheduler thread; sockets are non-blocking and registered as
//! monitors, so a slow client only ever blocks itself: a partially written
//! message parks in that client's outbox until its descriptor drains.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use core_braille::{BrailleSession, KeyEventHook};
use core_keytable::KeyValue;
use core_reports::{Report, ReportBus, ReportId};
use core_sched::{MonitorHandle, Scheduler};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthError, Authenticator, PeerIdentity};
use crate::host::HostSpec;
use crate::packet::{DecodeEvent, Packet, PacketDecoder};
use crate::params::{
    ParamAttributes, ParamError, ParamRegistry, ParamRequestFlags, ParamValue, id as param_id,
};
use crate::text::cells_for_text;
use crate::wire::{
    KeyRange, WireError, WriteRequest, driver_key_code, encode_error, encode_key_code, error_code,
    kind, parse_key_ranges, parse_tty_path,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientPhase {
    AwaitingVersion,
    AwaitingAuth,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientMode {
    Plain,
    Tty { path: Vec<u32> },
    Raw,
    Suspend,
}

enum ClientStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl ClientStream {
    fn raw_fd(&self) -> RawFd {
        match self {
            ClientStream::Unix(s) => s.as_raw_fd(),
            ClientStream::Tcp(s) => s.as_raw_fd(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(s) => s.read(buf),
            ClientStream::Tcp(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(s) => s.write(buf),
            ClientStream::Tcp(s) => s.write(buf),
        }
    }
}

struct Client {
    id: u64,
    stream: RefCell<ClientStream>,
    peer: PeerIdentity,
    decoder: RefCell<PacketDecoder>,
    phase: RefCell<ClientPhase>,
    mode: RefCell<ClientMode>,
    accepted: RefCell<Vec<KeyRange>>,
    ignored: RefCell<Vec<KeyRange>>,
    watches: RefCell<HashSet<u32>>,
    priority: Cell<u32>,
    /// This client's private window; shown while it is the active tty client.
    window: RefCell<Vec<u8>>,
    window_cursor: Cell<Option<usize>>,
    outbox: RefCell<VecDeque<Vec<u8>>>,
    outbox_offset: Cell<usize>,
    in_monitor: Cell<Option<MonitorHandle>>,
    out_monitor: Cell<Option<MonitorHandle>>,
    closed: Cell<bool>,
}

enum ListenSocket {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

struct Listener {
    socket: ListenSocket,
    monitor: MonitorHandle,
}

pub struct ApiServer {
    inner: Rc<ServerInner>,
}

struct ServerInner {
    sched: Rc<Scheduler>,
    display: Rc<BrailleSession>,
    bus: Rc<ReportBus>,
    params: ParamRegistry,
    auth: Authenticator,
    clients: RefCell<HashMap<u64, Rc<Client>>>,
    next_client: Cell<u64>,
    focus: RefCell<Vec<u32>>,
    listeners: RefCell<Vec<Listener>>,
    /// Client currently holding the raw or suspend claim on the device.
    controller: Cell<Option<u64>>,
}

struct ServerHook {
    inner: Weak<ServerInner>,
}

impl KeyEventHook for ServerHook {
    fn handle_key_event(&self, key: KeyValue, pressed: bool) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.route_key(driver_key_code(key, pressed)),
            None => false,
        }
    }
}

impl ApiServer {
    pub fn new(
        sched: Rc<Scheduler>,
        display: Rc<BrailleSession>,
        bus: Rc<ReportBus>,
        auth_token: &str,
    ) -> Result<Self, ApiError> {
        let params = ParamRegistry::new(Rc::clone(&bus));
        let (columns, rows) = display.dimensions();
        params.define(
            param_id::DRIVER_NAME,
            ParamAttributes::READABLE,
            ParamValue::Text(display.driver_name().to_string()),
        );
        params.define(
            param_id::MODEL_ID,
            ParamAttributes::READABLE,
            ParamValue::Text(display.driver_name().to_string()),
        );
        params.define(
            param_id::DISPLAY_SIZE,
            ParamAttributes::READABLE | ParamAttributes::WATCHABLE,
            ParamValue::U32(vec![columns as u32, rows as u32]),
        );
        params.define(
            param_id::DEVICE_ONLINE,
            ParamAttributes::READABLE | ParamAttributes::WATCHABLE,
            ParamValue::Bool(!display.has_failed()),
        );
        params.define(
            param_id::RETRY_INTERVAL,
            ParamAttributes::READABLE | ParamAttributes::WRITABLE | ParamAttributes::WATCHABLE,
            ParamValue::U32(vec![5000]),
        );
        params.define(
            param_id::COMPUTER_BRAILLE_CELL_SIZE,
            ParamAttributes::READABLE,
            ParamValue::U8(vec![8]),
        );

        let inner = Rc::new(ServerInner {
            sched,
            display,
            bus,
            params,
            auth: Authenticator::parse(auth_token)?,
            clients: RefCell::new(HashMap::new()),
            next_client: Cell::new(1),
            focus: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
            controller: Cell::new(None),
        });

        // Device key events pass through the server before the key table.
        inner.display.set_key_event_hook(Some(Rc::new(ServerHook {
            inner: Rc::downgrade(&inner),
        })));

        // Watched parameters fan out on every mutation.
        {
            let weak = Rc::downgrade(&inner);
            inner
                .bus
                .register_listener(ReportId::ParameterUpdated, move |report| {
                    if let (Some(inner), Report::ParameterUpdated { parameter, .. }) =
                        (weak.upgrade(), report)
                    {
                        inner.notify_watchers(*parameter);
                    }
                });
        }
        // The device-online parameter shadows device reports.
        {
            let weak = Rc::downgrade(&inner);
            inner
                .bus
                .register_listener(ReportId::BrailleDeviceOffline, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        let _ = inner
                            .params
                            .update(param_id::DEVICE_ONLINE, ParamValue::Bool(false));
                    }
                });
        }

        Ok(Self { inner })
    }

    /// Bind and start accepting on `spec`.
    pub fn listen(&self, spec: &HostSpec) -> Result<(), ApiError> {
        let socket = match spec {
            HostSpec::Local { path } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                info!(target: "api.server", path = %path.display(), "listening_local");
                ListenSocket::Unix(listener, path.clone())
            }
            HostSpec::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))?;
                listener.set_nonblocking(true)?;
                info!(target: "api.server", host = host.as_str(), port, "listening_tcp");
                ListenSocket::Tcp(listener)
            }
        };
        let fd = match &socket {
            ListenSocket::Unix(l, _) => l.as_raw_fd(),
            ListenSocket::Tcp(l) => l.as_raw_fd(),
        };
        let weak = Rc::downgrade(&self.inner);
        let index = self.inner.listeners.borrow().len();
        let monitor = self.inner.sched.monitor_input(fd, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.accept_ready(index);
            }
        });
        self.inner
            .listeners
            .borrow_mut()
            .push(Listener { socket, monitor });
        Ok(())
    }

    /// Close every client and listener; local socket files are removed.
    pub fn shutdown(&self) {
        let ids: Vec<u64> = self.inner.clients.borrow().keys().copied().collect();
        for id in ids {
            self.inner.close_client(id, "server_shutdown");
        }
        for listener in self.inner.listeners.borrow_mut().drain(..) {
            self.inner.sched.cancel_monitor(listener.monitor);
            if let ListenSocket::Unix(_, path) = listener.socket {
                let _ = std::fs::remove_file(path);
            }
        }
        self.inner.display.set_key_event_hook(None);
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    pub fn params(&self) -> &ParamRegistry {
        &self.inner.params
    }
}

impl ServerInner {
    fn accept_ready(self: &Rc<Self>, index: usize) {
        loop {
            let accepted = {
                let listeners = self.listeners.borrow();
                let Some(listener) = listeners.get(index) else {
                    return;
                };
                match &listener.socket {
                    ListenSocket::Unix(l, _) => match l.accept() {
                        Ok((stream, _)) => {
                            let peer = PeerIdentity::from_unix_stream(&stream);
                            Some((ClientStream::Unix(stream), peer))
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                        Err(e) => {
                            warn!(target: "api.server", error = %e, "accept_failed");
                            None
                        }
                    },
                    ListenSocket::Tcp(l) => match l.accept() {
                        Ok((stream, _)) => Some((ClientStream::Tcp(stream), PeerIdentity::Anonymous)),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                        Err(e) => {
                            warn!(target: "api.server", error = %e, "accept_failed");
                            None
                        }
                    },
                }
            };
            let Some((stream, peer)) = accepted else { return };
            self.admit(stream, peer);
        }
    }

    fn admit(self: &Rc<Self>, stream: ClientStream, peer: PeerIdentity) {
        let nonblocking = match &stream {
            ClientStream::Unix(s) => s.set_nonblocking(true),
            ClientStream::Tcp(s) => s.set_nonblocking(true),
        };
        if let Err(e) = nonblocking {
            warn!(target: "api.server", error = %e, "set_nonblocking_failed");
            return;
        }

        let id = self.next_client.get();
        self.next_client.set(id + 1);
        let fd = stream.raw_fd();
        let client = Rc::new(Client {
            id,
            stream: RefCell::new(stream),
            peer,
            decoder: RefCell::new(PacketDecoder::new()),
            phase: RefCell::new(ClientPhase::AwaitingVersion),
            mode: RefCell::new(ClientMode::Plain),
            accepted: RefCell::new(Vec::new()),
            ignored: RefCell::new(Vec::new()),
            watches: RefCell::new(HashSet::new()),
            priority: Cell::new(50),
            window: RefCell::new(vec![0; self.display.cell_count()]),
            window_cursor: Cell::new(None),
            outbox: RefCell::new(VecDeque::new()),
            outbox_offset: Cell::new(0),
            in_monitor: Cell::new(None),
            out_monitor: Cell::new(None),
            closed: Cell::new(false),
        });
        self.clients.borrow_mut().insert(id, Rc::clone(&client));

        let weak = Rc::downgrade(self);
        let monitor = self.sched.monitor_input(fd, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.client_readable(id);
            }
        });
        client.in_monitor.set(Some(monitor));

        debug!(target: "api.server", client = id, ?peer, "client_connected");
        self.bus.report(&Report::ApiClientConnected { session: id });
        self.send_packet(
            &client,
            kind::VERSION,
            crate::wire::PROTOCOL_VERSION.to_be_bytes().to_vec(),
        );
    }

    fn client(&self, id: u64) -> Option<Rc<Client>> {
        self.clients.borrow().get(&id).cloned()
    }

    fn client_readable(self: &Rc<Self>, id: u64) {
        let Some(client) = self.client(id) else { return };
        let mut buf = [0u8; 4096];
        loop {
            if client.closed.get() {
                return;
            }
            let read = client.stream.borrow_mut().read(&mut buf);
            match read {
                Ok(0) => {
                    self.close_client(id, "eof");
                    return;
                }
                Ok(n) => {
                    let events = client.decoder.borrow_mut().push_bytes(&buf[..n]);
                    for event in events {
                        match event {
                            DecodeEvent::Packet(packet) => self.handle_packet(&client, packet),
                            DecodeEvent::Oversize { kind: k, .. } => {
                                self.send_error(&client, error_code::INVALID_INPUT, k);
                            }
                        }
                        if client.closed.get() {
                            return;
                        }
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return;
                }
                Err(e) => {
                    warn!(target: "api.server", client = id, error = %e, "client_read_failed");
                    self.close_client(id, "io_error");
                    return;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    fn send_packet(self: &Rc<Self>, client: &Rc<Client>, kind: u32, payload: Vec<u8>) {
        if client.closed.get() {
            return;
        }
        client
            .outbox
            .borrow_mut()
            .push_back(Packet::new(kind, payload).encode());
        self.flush_client(client);
    }

    fn send_error(self: &Rc<Self>, client: &Rc<Client>, code: u32, in_reply_to: u32) {
        debug!(target: "api.server", client = client.id, code, "error_sent");
        self.send_packet(client, kind::ERROR, encode_error(code, in_reply_to));
    }

    fn send_ack(self: &Rc<Self>, client: &Rc<Client>) {
        self.send_packet(client, kind::ACK, Vec::new());
    }

    /// Exceptions are fatal to the session: the violation is reported, then
    /// the connection closes.
    fn send_exception(self: &Rc<Self>, client: &Rc<Client>, code: u32, in_reply_to: u32) {
        debug!(target: "api.server", client = client.id, code, "exception_sent");
        self.send_packet(client, kind::EXCEPTION, encode_error(code, in_reply_to));
    }

    fn flush_client(self: &Rc<Self>, client: &Rc<Client>) {
        loop {
            let (front, offset) = {
                let outbox = client.outbox.borrow();
                match outbox.front() {
                    Some(front) => (front.clone(), client.outbox_offset.get()),
                    None => break,
                }
            };
            let result = client.stream.borrow_mut().write(&front[offset..]);
            match result {
                Ok(0) => {
                    self.close_client(client.id, "write_closed");
                    return;
                }
                Ok(n) if offset + n == front.len() => {
                    client.outbox.borrow_mut().pop_front();
                    client.outbox_offset.set(0);
                }
                Ok(n) => {
                    client.outbox_offset.set(offset + n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "api.server", client = client.id, error = %e, "client_write_failed");
                    self.close_client(client.id, "io_error");
                    return;
                }
            }
        }

        let pending = !client.outbox.borrow().is_empty();
        let armed = client.out_monitor.get().is_some();
        if pending && !armed {
            let weak = Rc::downgrade(self);
            let id = client.id;
            let fd = client.stream.borrow().raw_fd();
            let monitor = self.sched.monitor_output(fd, move |_| {
                if let Some(inner) = weak.upgrade() {
                    if let Some(client) = inner.client(id) {
                        inner.flush_client(&client);
                    }
                }
            });
            client.out_monitor.set(Some(monitor));
        } else if !pending && armed {
            if let Some(monitor) = client.out_monitor.take() {
                self.sched.cancel_monitor(monitor);
            }
        }
    }

    fn close_client(self: &Rc<Self>, id: u64, reason: &'static str) {
        let Some(client) = self.clients.borrow_mut().remove(&id) else {
            return;
        };
        client.closed.set(true);
        if let Some(monitor) = client.in_monitor.take() {
            self.sched.cancel_monitor(monitor);
        }
        if let Some(monitor) = client.out_monitor.take() {
            self.sched.cancel_monitor(monitor);
        }
        self.release_display_claim(&client);
        debug!(target: "api.server", client = id, reason, "client_closed");
        self.bus
            .report(&Report::ApiClientDisconnected { session: id });
    }

    fn release_display_claim(&self, client: &Client) {
        if self.controller.get() == Some(client.id) {
            self.controller.set(None);
            match &*client.mode.borrow() {
                ClientMode::Raw => self.display.set_raw_sink(None),
                ClientMode::Suspend => self.display.resume(),
                _ => {}
            }
        }
    }

    // -----------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------

    fn handle_packet(self: &Rc<Self>, client: &Rc<Client>, packet: Packet) {
        trace!(
            target: "api.server",
            client = client.id,
            kind = kind::name(packet.kind),
            len = packet.payload.len(),
            "packet"
        );
        let phase = client.phase.borrow().clone();
        match phase {
            ClientPhase::AwaitingVersion => {
                if packet.kind != kind::VERSION || packet.payload.len() != 4 {
                    self.send_exception(client, error_code::INVALID_STATE, packet.kind);
                    self.close_client(client.id, "bad_handshake");
                    return;
                }
                *client.phase.borrow_mut() = ClientPhase::AwaitingAuth;
            }
            ClientPhase::AwaitingAuth => {
                if packet.kind != kind::AUTH {
                    self.send_exception(client, error_code::INVALID_STATE, packet.kind);
                    self.close_client(client.id, "bad_handshake");
                    return;
                }
                if self.auth.verify(client.peer, &packet.payload) {
                    *client.phase.borrow_mut() = ClientPhase::Ready;
                    self.send_ack(client);
                } else {
                    self.send_error(client, error_code::NOT_AUTHORIZED, packet.kind);
                    self.close_client(client.id, "auth_failed");
                }
            }
            ClientPhase::Ready => self.handle_request(client, packet),
        }
    }

    fn handle_request(self: &Rc<Self>, client: &Rc<Client>, packet: Packet) {
        match packet.kind {
            kind::GET_DRIVER_NAME => {
                let name = self.display.driver_name().as_bytes().to_vec();
                self.send_packet(client, kind::GET_DRIVER_NAME, name);
            }
            kind::GET_MODEL_ID => {
                let name = self.display.driver_name().as_bytes().to_vec();
                self.send_packet(client, kind::GET_MODEL_ID, name);
            }
            kind::GET_DISPLAY_SIZE => {
                let (columns, rows) = self.display.dimensions();
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&(columns as u32).to_be_bytes());
                payload.extend_from_slice(&(rows as u32).to_be_bytes());
                self.send_packet(client, kind::GET_DISPLAY_SIZE, payload);
            }
            kind::ENTER_TTY_MODE => match parse_tty_path(&packet.payload) {
                Ok(path) => {
                    if *client.mode.borrow() != ClientMode::Plain {
                        self.send_error(client, error_code::INVALID_STATE, packet.kind);
                        return;
                    }
                    debug!(target: "api.server", client = client.id, ?path, "tty_mode");
                    *client.mode.borrow_mut() = ClientMode::Tty { path };
                    self.send_ack(client);
                }
                Err(_) => self.send_error(client, error_code::INVALID_INPUT, packet.kind),
            },
            kind::SET_FOCUS => match parse_tty_path(&packet.payload) {
                Ok(path) => {
                    trace!(target: "api.server", ?path, "focus");
                    *self.focus.borrow_mut() = path;
                    self.refresh_active_window();
                }
                Err(_) => self.send_error(client, error_code::INVALID_INPUT, packet.kind),
            },
            kind::LEAVE_TTY_MODE => {
                if matches!(&*client.mode.borrow(), ClientMode::Tty { .. }) {
                    *client.mode.borrow_mut() = ClientMode::Plain;
                    self.send_ack(client);
                } else {
                    self.send_error(client, error_code::INVALID_STATE, packet.kind);
                }
            }
            kind::ACCEPT_KEY_RANGES => match parse_key_ranges(&packet.payload) {
                Ok(ranges) => {
                    *client.accepted.borrow_mut() = ranges;
                    self.send_ack(client);
                }
                Err(_) => self.send_error(client, error_code::INVALID_INPUT, packet.kind),
            },
            kind::IGNORE_KEY_RANGES => match parse_key_ranges(&packet.payload) {
                Ok(ranges) => {
                    *client.ignored.borrow_mut() = ranges;
                    self.send_ack(client);
                }
                Err(_) => self.send_error(client, error_code::INVALID_INPUT, packet.kind),
            },
            kind::WRITE => self.handle_write(client, &packet),
            kind::ENTER_RAW_MODE => {
                if self.controller.get().is_some() {
                    self.send_error(client, error_code::BUSY, packet.kind);
                    return;
                }
                if *client.mode.borrow() != ClientMode::Plain {
                    self.send_error(client, error_code::INVALID_STATE, packet.kind);
                    return;
                }
                self.controller.set(Some(client.id));
                *client.mode.borrow_mut() = ClientMode::Raw;
                let weak = Rc::downgrade(self);
                let id = client.id;
                self.display.set_raw_sink(Some(Box::new(move |payload: &[u8]| {
                    if let Some(inner) = weak.upgrade() {
                        if let Some(client) = inner.client(id) {
                            inner.send_packet(&client, kind::PACKET, payload.to_vec());
                        }
                    }
                })));
                info!(target: "api.server", client = client.id, "raw_mode_entered");
                self.send_ack(client);
            }
            kind::LEAVE_RAW_MODE => {
                if *client.mode.borrow() == ClientMode::Raw {
                    self.release_display_claim(client);
                    *client.mode.borrow_mut() = ClientMode::Plain;
                    self.send_ack(client);
                } else {
                    self.send_error(client, error_code::INVALID_STATE, packet.kind);
                }
            }
            kind::PACKET => {
                if *client.mode.borrow() == ClientMode::Raw {
                    if let Err(e) = self.display.send_raw_packet(&packet.payload) {
                        warn!(target: "api.server", error = %e, "raw_write_failed");
                        self.send_error(client, error_code::IO, packet.kind);
                    }
                } else {
                    self.send_error(client, error_code::INVALID_STATE, packet.kind);
                }
            }
            kind::SUSPEND_DRIVER => {
                if self.controller.get().is_some() {
                    self.send_error(client, error_code::BUSY, packet.kind);
                    return;
                }
                if *client.mode.borrow() != ClientMode::Plain {
                    self.send_error(client, error_code::INVALID_STATE, packet.kind);
                    return;
                }
                self.controller.set(Some(client.id));
                *client.mode.borrow_mut() = ClientMode::Suspend;
                self.display.suspend();
                self.send_ack(client);
            }
            kind::RESUME_DRIVER => {
                if *client.mode.borrow() == ClientMode::Suspend {
                    self.release_display_claim(client);
                    *client.mode.borrow_mut() = ClientMode::Plain;
                    self.send_ack(client);
                } else {
                    self.send_error(client, error_code::INVALID_STATE, packet.kind);
                }
            }
            kind::PARAM_REQUEST => self.handle_param_request(client, &packet),
            kind::SYNCHRONIZE => {
                // Single-threaded: every prior request has fully executed.
                self.send_ack(client);
            }
            kind::VERSION | kind::AUTH => {
                self.send_error(client, error_code::INVALID_STATE, packet.kind)
            }
            other => {
                debug!(target: "api.server", client = client.id, kind = other, "unknown_packet");
                self.send_error(client, error_code::INVALID_INPUT, other);
            }
        }
    }

    fn handle_write(self: &Rc<Self>, client: &Rc<Client>, packet: &Packet) {
        if !matches!(&*client.mode.borrow(), ClientMode::Tty { .. }) {
            self.send_error(client, error_code::INVALID_STATE, packet.kind);
            return;
        }
        let request = match WriteRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(WireError::Truncated { .. } | WireError::Malformed { .. }) => {
                self.send_error(client, error_code::INVALID_INPUT, packet.kind);
                return;
            }
        };
        let cell_count = self.display.cell_count();
        // Region addressing is 1-based; omitted region means the whole window.
        let begin = request.region_begin.unwrap_or(1).saturating_sub(1) as usize;
        let size = request.region_size.unwrap_or(cell_count as u32) as usize;
        if begin >= cell_count || size == 0 {
            self.send_error(client, error_code::INVALID_INPUT, packet.kind);
            return;
        }
        let size = size.min(cell_count - begin);

        // Without text the masks modify the previously written cells in
        // place, so the region starts from the client's window, not zeros.
        let mut region = match &request.text {
            Some(text) => {
                let mut region = vec![0u8; size];
                let cells = cells_for_text(text);
                let n = cells.len().min(size);
                region[..n].copy_from_slice(&cells[..n]);
                region
            }
            None => client.window.borrow()[begin..begin + size].to_vec(),
        };
        if let Some(and) = &request.and_mask {
            for (slot, mask) in region.iter_mut().zip(and) {
                *slot &= mask;
            }
        }
        if let Some(or) = &request.or_mask {
            for (slot, mask) in region.iter_mut().zip(or) {
                *slot |= mask;
            }
        }

        {
            let mut window = client.window.borrow_mut();
            window[begin..begin + size].copy_from_slice(&region);
        }
        // An absent cursor field leaves the stored cursor alone; the wire
        // sentinel 0 is the explicit "no cursor".
        if let Some(cursor) = request.cursor {
            client.window_cursor.set(match cursor {
                0 => None,
                c => Some((c - 1) as usize),
            });
        }

        if self.active_tty_client().map(|c| c.id) == Some(client.id) {
            let window = client.window.borrow();
            self.display.write_cells(&window, client.window_cursor.get());
        }
        self.send_ack(client);
    }

    fn handle_param_request(self: &Rc<Self>, client: &Rc<Client>, packet: &Packet) {
        if packet.payload.len() < 12 {
            self.send_error(client, error_code::INVALID_INPUT, packet.kind);
            return;
        }
        let flags = ParamRequestFlags::from_bits_truncate(u32::from_be_bytes([
            packet.payload[0],
            packet.payload[1],
            packet.payload[2],
            packet.payload[3],
        ]));
        let param = u32::from_be_bytes([
            packet.payload[4],
            packet.payload[5],
            packet.payload[6],
            packet.payload[7],
        ]);
        let subparam = u32::from_be_bytes([
            packet.payload[8],
            packet.payload[9],
            packet.payload[10],
            packet.payload[11],
        ]);
        let body = &packet.payload[12..];

        // Client priority is per-session state, not driver state.
        let local = param == param_id::CLIENT_PRIORITY
            && !flags.contains(ParamRequestFlags::GLOBAL);

        if flags.contains(ParamRequestFlags::SET) {
            let outcome = if local {
                match body.try_into().map(u32::from_be_bytes) {
                    Ok(priority) => {
                        client.priority.set(priority);
                        self.refresh_active_window();
                        Ok(())
                    }
                    Err(_) => Err(ParamError::BadValue),
                }
            } else {
                self.params.set_from_wire(param, body)
            };
            match outcome {
                Ok(()) => self.send_ack(client),
                Err(e) => self.send_error(client, param_error_code(&e), packet.kind),
            }
            return;
        }

        if flags.contains(ParamRequestFlags::WATCH) {
            let watchable = self
                .params
                .attributes(param)
                .is_some_and(|a| a.contains(ParamAttributes::WATCHABLE));
            if !watchable {
                self.send_error(client, error_code::UNSUPPORTED, packet.kind);
                return;
            }
            client.watches.borrow_mut().insert(param);
        }

        let value = if local {
            Ok(ParamValue::U32(vec![client.priority.get()]))
        } else {
            self.params.get(param)
        };
        match value {
            Ok(value) => {
                let payload = param_value_payload(flags, param, subparam, &value);
                self.send_packet(client, kind::PARAM_VALUE, payload);
            }
            Err(e) => self.send_error(client, param_error_code(&e), packet.kind),
        }
    }

    fn notify_watchers(self: &Rc<Self>, param: u32) {
        let value = match self.params.get(param) {
            Ok(value) => value,
            Err(_) => return,
        };
        let clients: Vec<Rc<Client>> = self.clients.borrow().values().cloned().collect();
        for client in clients {
            if client.watches.borrow().contains(&param) {
                let payload =
                    param_value_payload(ParamRequestFlags::GLOBAL, param, 0, &value);
                self.send_packet(&client, kind::PARAM_VALUE, payload);
            }
        }
    }

    // -----------------------------------------------------------------
    // Key routing
    // -----------------------------------------------------------------

    /// The tty client whose claimed path is the deepest prefix of the
    /// current focus; ties resolve to the higher priority, then the earlier
    /// connection.
    fn active_tty_client(&self) -> Option<Rc<Client>> {
        let focus = self.focus.borrow();
        let mut best: Option<(usize, u32, u64, Rc<Client>)> = None;
        for client in self.clients.borrow().values() {
            let mode = client.mode.borrow();
            let ClientMode::Tty { path } = &*mode else {
                continue;
            };
            if !focus.starts_with(path) {
                continue;
            }
            let candidate = (path.len(), client.priority.get(), u64::MAX - client.id);
            let better = match &best {
                Some((depth, priority, anti_id, _)) => {
                    candidate > (*depth, *priority, *anti_id)
                }
                None => true,
            };
            if better {
                best = Some((candidate.0, candidate.1, candidate.2, Rc::clone(client)));
            }
        }
        best.map(|(_, _, _, client)| client)
    }

    /// Re-show the active client's window after focus or priority changes.
    fn refresh_active_window(self: &Rc<Self>) {
        if let Some(client) = self.active_tty_client() {
            let window = client.window.borrow();
            self.display.write_cells(&window, client.window_cursor.get());
        }
    }

    /// Deliver a key to the active tty client if it wants it; returns whether
    /// the key was consumed.
    fn route_key(self: &Rc<Self>, code: u64) -> bool {
        let Some(client) = self.active_tty_client() else {
            return false;
        };
        let accepted = client.accepted.borrow();
        let ignored = client.ignored.borrow();
        let wanted = (accepted.is_empty() || accepted.iter().any(|r| r.matches(code)))
            && !ignored.iter().any(|r| r.matches(code));
        drop(accepted);
        drop(ignored);
        if !wanted {
            return false;
        }
        trace!(target: "api.server", client = client.id, code, "key_routed");
        self.send_packet(&client, kind::KEY, encode_key_code(code).to_vec());
        true
    }
}

fn param_error_code(error: &ParamError) -> u32 {
    match error {
        ParamError::Unknown => error_code::INVALID_INPUT,
        ParamError::BadValue => error_code::INVALID_INPUT,
        ParamError::NotReadable | ParamError::NotWritable => error_code::NOT_AUTHORIZED,
        ParamError::NotWatchable => error_code::UNSUPPORTED,
    }
}

fn param_value_payload(
    flags: ParamRequestFlags,
    param: u32,
    subparam: u32,
    value: &ParamValue,
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&flags.bits().to_be_bytes());
    payload.extend_from_slice(&param.to_be_bytes());
    payload.extend_from_slice(&subparam.to_be_bytes());
    payload.extend_from_slice(&value.encode());
    payload
}
