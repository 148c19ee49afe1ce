//! The braille session: one per attached display.
//!
//! Owns the endpoint, renders the window through the device dot order,
//! transmits only changed cells, drives the acknowledgement queue, and fans
//! driver key events in through the API hook before they reach the key
//! table. Raw mode and suspension give an API client the device for itself:
//! while either is active the session refuses cell writes from other
//! sources.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use core_keytable::{KeyTableRuntime, KeyValue};
use core_reports::{Report, ReportBus};
use core_sched::{MonitorHandle, Scheduler};
use core_transport::{Endpoint, PacketReader, TransportError};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::ack::{AckMessage, AckQueue};
use crate::buffer::BrailleBuffer;
use crate::dots::DotTable;
use crate::framing::{FrameVerifier, LinkEvent, encode_frame, parse_frame};

/// Dots 7+8 overlay marking the cursor cell.
const CURSOR_DOTS: u8 = 0b1100_0000;

/// Device-protocol message kinds, outbound.
pub mod msg {
    /// `[offset, cells...]` — text area cells starting at offset.
    pub const TEXT_CELLS: u8 = 0x02;
    /// `[cells...]` — the whole status area.
    pub const STATUS_CELLS: u8 = 0x03;
}

/// Device-protocol report kinds, inbound.
pub mod report {
    /// `[0x10, group, number_hi, number_lo, pressed]`
    pub const KEY_EVENT: u8 = 0x10;
    /// `[0x11, group, bits_be_u64]`
    pub const KEY_SET: u8 = 0x11;
}

/// Interception point for the API server: a client in tty or raw mode may
/// consume key events before the key table sees them.
pub trait KeyEventHook {
    fn handle_key_event(&self, key: KeyValue, pressed: bool) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub ack_timeout: Duration,
    pub ack_limit: u32,
    pub read_subsequent: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            ack_limit: 3,
            read_subsequent: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct SessionConfig {
    pub driver_name: &'static str,
    pub columns: usize,
    pub rows: usize,
    pub status_cells: usize,
    pub dot_table: DotTable,
    pub timings: SessionTimings,
}

pub struct BrailleSession {
    driver_name: &'static str,
    endpoint: Rc<RefCell<Box<dyn Endpoint>>>,
    dots: DotTable,
    buffer: RefCell<BrailleBuffer>,
    ack: AckQueue,
    reader: RefCell<PacketReader>,
    verifier: RefCell<FrameVerifier>,
    link_events: Rc<RefCell<Vec<LinkEvent>>>,
    key_sets: RefCell<HashMap<u8, u64>>,
    keytable: Rc<KeyTableRuntime>,
    hook: RefCell<Option<Rc<dyn KeyEventHook>>>,
    bus: Rc<ReportBus>,
    failed: Rc<Cell<bool>>,
    suspended: Cell<bool>,
    seq: Rc<Cell<u8>>,
    raw_sink: RefCell<Option<Box<dyn FnMut(&[u8])>>>,
    /// Bumped on every sink change so a sink taken out for a call is only
    /// re-installed if raw mode was not torn down while it ran.
    raw_generation: Cell<u64>,
    read_subsequent: Duration,
}

impl BrailleSession {
    pub fn new(
        sched: Rc<Scheduler>,
        endpoint: Box<dyn Endpoint>,
        keytable: Rc<KeyTableRuntime>,
        bus: Rc<ReportBus>,
        config: SessionConfig,
    ) -> Rc<Self> {
        let endpoint = Rc::new(RefCell::new(endpoint));
        let failed = Rc::new(Cell::new(false));
        let seq = Rc::new(Cell::new(0u8));

        let transmit = {
            let endpoint = Rc::clone(&endpoint);
            let seq = Rc::clone(&seq);
            move |message: &AckMessage| {
                let mut wire_payload = Vec::with_capacity(message.payload.len() + 1);
                wire_payload.push(message.kind);
                wire_payload.extend_from_slice(&message.payload);
                let frame_seq = seq.get();
                seq.set(frame_seq.wrapping_add(1));
                let frame = encode_frame(&wire_payload, frame_seq);
                match endpoint.borrow_mut().write_data(&frame) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(target: "braille.session", error = %e, "device_write_failed");
                        false
                    }
                }
            }
        };
        let on_failure = {
            let failed = Rc::clone(&failed);
            let bus = Rc::clone(&bus);
            let driver = config.driver_name;
            move || {
                failed.set(true);
                bus.report(&Report::BrailleDeviceOffline { driver });
            }
        };
        let ack = AckQueue::new(
            sched,
            config.timings.ack_timeout,
            config.timings.ack_limit,
            transmit,
            on_failure,
        );

        let (verifier, link_events) = FrameVerifier::new();
        Rc::new(Self {
            driver_name: config.driver_name,
            endpoint,
            dots: config.dot_table,
            buffer: RefCell::new(BrailleBuffer::new(
                config.columns,
                config.rows,
                config.status_cells,
            )),
            ack,
            reader: RefCell::new(PacketReader::new()),
            verifier: RefCell::new(verifier),
            link_events,
            key_sets: RefCell::new(HashMap::new()),
            keytable,
            hook: RefCell::new(None),
            bus,
            failed,
            suspended: Cell::new(false),
            seq,
            raw_sink: RefCell::new(None),
            raw_generation: Cell::new(0),
            read_subsequent: config.timings.read_subsequent,
        })
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver_name
    }

    pub fn cell_count(&self) -> usize {
        self.buffer.borrow().cell_count()
    }

    pub fn dimensions(&self) -> (usize, usize) {
        let buffer = self.buffer.borrow();
        (buffer.columns(), buffer.rows())
    }

    pub fn has_failed(&self) -> bool {
        self.failed.get()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.get()
    }

    /// Install the API interception hook.
    pub fn set_key_event_hook(&self, hook: Option<Rc<dyn KeyEventHook>>) {
        *self.hook.borrow_mut() = hook;
    }

    /// Enter raw mode: device frames go to `sink` instead of the session.
    pub fn set_raw_sink(&self, sink: Option<Box<dyn FnMut(&[u8])>>) {
        self.raw_generation.set(self.raw_generation.get() + 1);
        *self.raw_sink.borrow_mut() = sink;
    }

    pub fn raw_mode_active(&self) -> bool {
        self.raw_sink.borrow().is_some()
    }

    /// Detach from the display so one client can drive it exclusively.
    pub fn suspend(&self) {
        self.suspended.set(true);
        debug!(target: "braille.session", driver = self.driver_name, "suspended");
    }

    pub fn resume(&self) {
        self.suspended.set(false);
        self.buffer.borrow_mut().force_rewrite();
        debug!(target: "braille.session", driver = self.driver_name, "resumed");
    }

    /// Register the endpoint with the scheduler; frames are pumped whenever
    /// the descriptor is readable.
    pub fn register_input_monitor(self: &Rc<Self>, sched: &Scheduler) -> Option<MonitorHandle> {
        let fd = self.endpoint.borrow().raw_fd()?;
        let weak = Rc::downgrade(self);
        Some(sched.monitor_input(fd, move |_| {
            if let Some(session) = weak.upgrade() {
                session.pump_input();
            }
        }))
    }

    /// Replace the window contents; only changed cells go to the wire.
    pub fn write_cells(&self, cells: &[u8], cursor: Option<usize>) {
        if self.suspended.get() || self.raw_mode_active() {
            trace!(target: "braille.session", "write_refused_display_claimed");
            return;
        }
        let mut rendered = cells.to_vec();
        if let Some(c) = cursor {
            if c < rendered.len() {
                rendered[c] |= CURSOR_DOTS;
            }
        }
        {
            let mut buffer = self.buffer.borrow_mut();
            buffer.set_cells(&rendered);
            buffer.set_cursor(cursor);
        }
        self.flush();
    }

    pub fn write_status_cells(&self, cells: &[u8]) {
        if self.suspended.get() || self.raw_mode_active() {
            return;
        }
        self.buffer.borrow_mut().set_status_cells(cells);
        self.flush();
    }

    /// Transmit pending changes through the acknowledgement queue. One
    /// message per area per flush; the queue coalesces by kind, so bursts
    /// collapse to the newest contents.
    fn flush(&self) {
        if self.failed.get() {
            return;
        }
        let mut buffer = self.buffer.borrow_mut();
        // A single span per flush: the text-cells message kind coalesces in
        // the ack queue, so splitting one flush into several messages of the
        // same kind would drop all but the last. While a message is still
        // outstanding the replacement must cover the whole window, because
        // the queued message it supersedes may carry cells outside this
        // flush's span.
        let mut span = buffer.changed_runs(usize::MAX).into_iter().next();
        if span.is_some() && self.ack.outstanding_kind().is_some() {
            span = Some(0..buffer.cell_count());
        }
        let status_changed = buffer.status_changed();
        if span.is_none() && !status_changed {
            return;
        }
        if let Some(span) = &span {
            let cells = self.dots.translate(&buffer.cells()[span.clone()]);
            let mut payload = Vec::with_capacity(cells.len() + 1);
            payload.push(span.start as u8);
            payload.extend_from_slice(&cells);
            self.ack.enqueue(msg::TEXT_CELLS, payload);
        }
        if status_changed && buffer.status_cell_count() > 0 {
            let cells = self.dots.translate(buffer.status_cells());
            self.ack.enqueue(msg::STATUS_CELLS, cells);
        }
        buffer.commit();
        drop(buffer);
        if let Some(span) = span {
            self.bus.report(&Report::BrailleWindowUpdated {
                cell_count: span.len(),
            });
        }
    }

    /// Write a client-supplied packet directly to the device (raw mode).
    pub fn send_raw_packet(&self, payload: &[u8]) -> Result<(), SessionError> {
        let frame_seq = self.seq.get();
        self.seq.set(frame_seq.wrapping_add(1));
        let frame = encode_frame(payload, frame_seq);
        self.endpoint.borrow_mut().write_data(&frame)?;
        Ok(())
    }

    /// Drain frames and link events from the device.
    pub fn pump_input(self: &Rc<Self>) {
        loop {
            let result = {
                let mut endpoint = self.endpoint.borrow_mut();
                let mut reader = self.reader.borrow_mut();
                let mut verifier = self.verifier.borrow_mut();
                reader.read(
                    endpoint.as_mut(),
                    &mut |bytes, expected| verifier.verify(bytes, expected),
                    Duration::ZERO,
                    self.read_subsequent,
                )
            };
            self.drain_link_events();
            match result {
                Ok(Some(window)) => match parse_frame(&window) {
                    Ok(frame) => self.handle_frame(&frame.payload),
                    Err(e) => {
                        warn!(target: "braille.session", error = %e, "bad_frame_dropped");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "braille.session", error = %e, "device_read_failed");
                    if !self.failed.replace(true) {
                        self.bus.report(&Report::BrailleDeviceOffline {
                            driver: self.driver_name,
                        });
                    }
                    break;
                }
            }
        }
    }

    fn drain_link_events(&self) {
        let events: Vec<LinkEvent> = self.link_events.borrow_mut().drain(..).collect();
        for event in events {
            match event {
                LinkEvent::Ack => self.ack.acknowledged(),
                LinkEvent::Nak(code) => {
                    debug!(target: "braille.session", code, "device_nak");
                    self.ack.rejected();
                }
            }
        }
    }

    fn handle_frame(self: &Rc<Self>, payload: &[u8]) {
        // The sink may tear raw mode down reentrantly (dead client), so it
        // must not run under the slot's borrow.
        let taken = self.raw_sink.borrow_mut().take();
        if let Some(mut sink) = taken {
            let generation = self.raw_generation.get();
            sink(payload);
            if self.raw_generation.get() == generation {
                *self.raw_sink.borrow_mut() = Some(sink);
            }
            return;
        }
        match payload.first() {
            Some(&report::KEY_EVENT) if payload.len() >= 5 => {
                let key = KeyValue::new(payload[1], u16::from_be_bytes([payload[2], payload[3]]));
                self.enqueue_key_event(key, payload[4] != 0);
            }
            Some(&report::KEY_SET) if payload.len() >= 10 => {
                let group = payload[1];
                let mut bits = [0u8; 8];
                bits.copy_from_slice(&payload[2..10]);
                self.enqueue_updated_keys(group, u64::from_be_bytes(bits));
            }
            _ => {
                debug!(target: "braille.session", len = payload.len(), "unknown_device_report");
            }
        }
    }

    /// Deposit one key edge, passing it through the API hook first.
    pub fn enqueue_key_event(self: &Rc<Self>, key: KeyValue, pressed: bool) {
        if let Some(hook) = self.hook.borrow().as_ref() {
            if hook.handle_key_event(key, pressed) {
                trace!(target: "braille.session", ?key, pressed, "key_consumed_by_api");
                return;
            }
        }
        self.bus.report(&Report::BrailleKeyEvent {
            group: key.group,
            number: key.number,
            pressed,
        });
        self.keytable.process_key_event(key, pressed);
    }

    /// Momentary chord: press every set bit in ascending order, then release
    /// in descending order so the full combination is observable mid-way.
    pub fn enqueue_keys(self: &Rc<Self>, group: u8, bits: u64) {
        for number in 0..64 {
            if bits & (1 << number) != 0 {
                self.enqueue_key_event(KeyValue::new(group, number), true);
            }
        }
        for number in (0..64).rev() {
            if bits & (1 << number) != 0 {
                self.enqueue_key_event(KeyValue::new(group, number), false);
            }
        }
    }

    /// Diff against the previously reported set for this group: new presses
    /// ascending, then stale releases descending.
    pub fn enqueue_updated_keys(self: &Rc<Self>, group: u8, bits: u64) {
        let old = self.key_sets.borrow_mut().insert(group, bits).unwrap_or(0);
        let pressed = bits & !old;
        let released = old & !bits;
        for number in 0..64 {
            if pressed & (1 << number) != 0 {
                self.enqueue_key_event(KeyValue::new(group, number), true);
            }
        }
        for number in (0..64).rev() {
            if released & (1 << number) != 0 {
                self.enqueue_key_event(KeyValue::new(group, number), false);
            }
        }
    }

    /// Acknowledge path for drivers without a hardware handshake (tests).
    pub fn ack_queue(&self) -> &AckQueue {
        &self.ack
    }
}
