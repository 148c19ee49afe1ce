//! Acknowledgement-queue retransmission.
//!
//! Devices that handshake get at most one un-acknowledged message on the
//! wire. Further messages queue behind it, coalescing by message kind: a new
//! message of a queued kind replaces that entry in place, so the device only
//! ever sees the latest cells of each kind (last-write-wins). Only the head
//! is ever transmitted; queue order beyond the coalescing rule carries no
//! other meaning.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use core_sched::{OwnedAlarm, Scheduler};
use tracing::{debug, trace, warn};

/// One outbound message: a device-protocol kind plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Transmit callback; returns whether the write reached the endpoint.
/// Must not call back into the queue.
type Transmit = Box<dyn FnMut(&AckMessage) -> bool>;
type FailureHook = Box<dyn FnMut()>;

struct AckInner {
    sched: Rc<Scheduler>,
    timeout: Duration,
    missing_limit: u32,
    missing_count: u32,
    outstanding: Option<AckMessage>,
    pending: VecDeque<AckMessage>,
    alarm: Option<OwnedAlarm>,
    transmit: Transmit,
    on_failure: FailureHook,
    failed: bool,
}

#[derive(Clone)]
pub struct AckQueue {
    inner: Rc<RefCell<AckInner>>,
}

impl AckQueue {
    pub fn new(
        sched: Rc<Scheduler>,
        timeout: Duration,
        missing_limit: u32,
        transmit: impl FnMut(&AckMessage) -> bool + 'static,
        on_failure: impl FnMut() + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(AckInner {
                sched,
                timeout,
                missing_limit: missing_limit.max(1),
                missing_count: 0,
                outstanding: None,
                pending: VecDeque::new(),
                alarm: None,
                transmit: Box::new(transmit),
                on_failure: Box::new(on_failure),
                failed: false,
            })),
        }
    }

    /// Send or queue a message. A queued message of the same kind is
    /// replaced in place.
    pub fn enqueue(&self, kind: u8, payload: Vec<u8>) {
        let message = AckMessage { kind, payload };
        let mut inner = self.inner.borrow_mut();
        if inner.failed {
            warn!(target: "braille.ack", kind, "enqueue_after_failure_dropped");
            return;
        }
        if inner.outstanding.is_some() {
            if let Some(slot) = inner.pending.iter_mut().find(|m| m.kind == kind) {
                trace!(target: "braille.ack", kind, "message_coalesced");
                *slot = message;
            } else {
                inner.pending.push_back(message);
            }
            return;
        }
        Self::transmit_now(&self.inner, &mut inner, message);
    }

    /// The device acknowledged the outstanding message.
    pub fn acknowledged(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.missing_count = 0;
        if inner.outstanding.take().is_none() {
            debug!(target: "braille.ack", "unexpected_ack");
        }
        match inner.pending.pop_front() {
            Some(next) => Self::transmit_now(&self.inner, &mut inner, next),
            None => inner.alarm = None,
        }
    }

    /// The device rejected the outstanding message (NAK): retransmit it,
    /// counting the miss.
    pub fn rejected(&self) {
        self.missed("nak");
    }

    pub fn has_failed(&self) -> bool {
        self.inner.borrow().failed
    }

    pub fn outstanding_kind(&self) -> Option<u8> {
        self.inner.borrow().outstanding.as_ref().map(|m| m.kind)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    fn transmit_now(
        rc: &Rc<RefCell<AckInner>>,
        inner: &mut std::cell::RefMut<'_, AckInner>,
        message: AckMessage,
    ) {
        trace!(target: "braille.ack", kind = message.kind, len = message.payload.len(), "transmit");
        let ok = (inner.transmit)(&message);
        inner.outstanding = Some(message);
        if !ok {
            Self::fail(inner);
            return;
        }
        Self::arm(rc, inner);
    }

    fn arm(rc: &Rc<RefCell<AckInner>>, inner: &mut std::cell::RefMut<'_, AckInner>) {
        let timeout = inner.timeout;
        match &inner.alarm {
            Some(alarm) => alarm.reset_in(timeout),
            None => {
                let weak: Weak<RefCell<AckInner>> = Rc::downgrade(rc);
                let handle = inner.sched.set_alarm_in(timeout, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        AckQueue { inner }.missed("timeout");
                    }
                });
                inner.alarm = Some(OwnedAlarm::new(Rc::clone(&inner.sched), handle));
            }
        }
    }

    fn missed(&self, cause: &'static str) {
        let mut inner = self.inner.borrow_mut();
        if inner.failed || inner.outstanding.is_none() {
            return;
        }
        inner.missing_count += 1;
        debug!(
            target: "braille.ack",
            cause,
            count = inner.missing_count,
            limit = inner.missing_limit,
            "ack_missing"
        );
        if inner.missing_count >= inner.missing_limit {
            Self::fail(&mut inner);
            return;
        }
        if let Some(message) = inner.outstanding.take() {
            Self::transmit_now(&self.inner, &mut inner, message);
        }
    }

    fn fail(inner: &mut std::cell::RefMut<'_, AckInner>) {
        warn!(target: "braille.ack", "driver_marked_failed");
        inner.failed = true;
        inner.alarm = None;
        inner.pending.clear();
        inner.outstanding = None;
        (inner.on_failure)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEXT_CELLS: u8 = 0x02;
    const STATUS_CELLS: u8 = 0x03;

    struct Harness {
        sched: Rc<Scheduler>,
        queue: AckQueue,
        sent: Rc<RefCell<Vec<AckMessage>>>,
        failed: Rc<RefCell<bool>>,
    }

    fn harness(timeout: Duration, limit: u32) -> Harness {
        let sched = Rc::new(Scheduler::new().expect("scheduler"));
        let sent = Rc::new(RefCell::new(Vec::new()));
        let failed = Rc::new(RefCell::new(false));
        let sink = Rc::clone(&sent);
        let flag = Rc::clone(&failed);
        let queue = AckQueue::new(
            Rc::clone(&sched),
            timeout,
            limit,
            move |m| {
                sink.borrow_mut().push(m.clone());
                true
            },
            move || *flag.borrow_mut() = true,
        );
        Harness {
            sched,
            queue,
            sent,
            failed,
        }
    }

    #[test]
    fn first_message_transmits_immediately() {
        let h = harness(Duration::from_millis(50), 3);
        h.queue.enqueue(TEXT_CELLS, vec![1, 2, 3]);
        assert_eq!(h.sent.borrow().len(), 1);
        assert_eq!(h.queue.outstanding_kind(), Some(TEXT_CELLS));
    }

    #[test]
    fn coalescing_keeps_only_the_latest_of_a_kind() {
        let h = harness(Duration::from_millis(100), 3);
        h.queue.enqueue(TEXT_CELLS, vec![1]);
        h.queue.enqueue(TEXT_CELLS, vec![2]);
        h.queue.enqueue(STATUS_CELLS, vec![9]);
        h.queue.enqueue(TEXT_CELLS, vec![3]);
        // One on the wire, two queued (text coalesced to the latest).
        assert_eq!(h.sent.borrow().len(), 1);
        assert_eq!(h.queue.pending_len(), 2);

        h.queue.acknowledged();
        h.queue.acknowledged();
        h.queue.acknowledged();
        let sent = h.sent.borrow();
        assert_eq!(sent[0].payload, vec![1]);
        assert_eq!(sent[1].payload, vec![3]);
        assert_eq!(sent[2].payload, vec![9]);
        assert!(!*h.failed.borrow());
    }

    #[test]
    fn ack_without_pending_disarms_the_timeout() {
        let h = harness(Duration::from_millis(30), 2);
        h.queue.enqueue(TEXT_CELLS, vec![1]);
        h.queue.acknowledged();
        // No retransmission after the timeout would have fired.
        h.sched.await_condition(Duration::from_millis(90), || false);
        assert_eq!(h.sent.borrow().len(), 1);
        assert!(!*h.failed.borrow());
    }

    #[test]
    fn timeout_retransmits_until_the_limit_then_fails() {
        let h = harness(Duration::from_millis(20), 3);
        h.queue.enqueue(TEXT_CELLS, vec![7]);
        assert!(
            h.sched
                .await_condition(Duration::from_secs(2), || *h.failed.borrow())
        );
        // Initial transmit + retries before the limit tripped.
        assert_eq!(h.sent.borrow().len(), 3);
        assert!(h.queue.has_failed());
    }

    #[test]
    fn nak_triggers_an_immediate_retransmission() {
        let h = harness(Duration::from_millis(200), 5);
        h.queue.enqueue(TEXT_CELLS, vec![7]);
        h.queue.rejected();
        assert_eq!(h.sent.borrow().len(), 2);
        h.queue.acknowledged();
        assert!(!h.queue.has_failed());
    }

    #[test]
    fn coalesced_burst_yields_one_transmission_and_no_misses() {
        // Three writes inside one ack window: exactly one extra transmission
        // after the ack, carrying the newest payload.
        let h = harness(Duration::from_millis(100), 3);
        h.queue.enqueue(TEXT_CELLS, vec![1]);
        h.queue.enqueue(TEXT_CELLS, vec![2]);
        h.queue.enqueue(TEXT_CELLS, vec![3]);
        assert_eq!(h.sent.borrow().len(), 1);
        h.queue.acknowledged();
        assert_eq!(h.sent.borrow().len(), 2);
        assert_eq!(h.sent.borrow()[1].payload, vec![3]);
        h.queue.acknowledged();
        h.sched.await_condition(Duration::from_millis(150), || false);
        assert!(!h.queue.has_failed());
        assert_eq!(h.sent.borrow().len(), 2);
    }
}
