//! Serial frame codec for the generic display protocol.
//!
//! Outgoing frames are `SOH length payload seq parity EOT`, where every
//! control byte inside the payload is prefixed with `DLE`. `length` counts
//! the unescaped payload bytes; `parity` is the XOR of the unescaped payload
//! and the sequence number. The receiver answers a bare `ACK`, or `NAK`
//! followed by a reason code when a frame arrives damaged.

use std::cell::RefCell;
use std::rc::Rc;

use core_transport::Verify;
use thiserror::Error;
use tracing::trace;

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const DLE: u8 = 0x10;
pub const NAK: u8 = 0x15;

/// NAK reason codes.
pub mod nak {
    pub const PARITY: u8 = 0x01;
    pub const LENGTH: u8 = 0x02;
    pub const OVERRUN: u8 = 0x03;
}

fn is_control(byte: u8) -> bool {
    matches!(byte, SOH | EOT | ACK | DLE | NAK)
}

/// Frame a payload for the wire.
pub fn encode_frame(payload: &[u8], seq: u8) -> Vec<u8> {
    debug_assert!(payload.len() <= u8::MAX as usize);
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(SOH);
    out.push(payload.len() as u8);
    let mut parity = seq;
    for &byte in payload {
        parity ^= byte;
        if is_control(byte) {
            out.push(DLE);
        }
        out.push(byte);
    }
    out.push(seq);
    out.push(parity);
    out.push(EOT);
    out
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short")]
    Truncated,
    #[error("missing frame delimiters")]
    BadDelimiters,
    #[error("length mismatch: declared {declared}, got {actual}")]
    BadLength { declared: usize, actual: usize },
    #[error("parity mismatch on frame {seq}")]
    BadParity { seq: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub seq: u8,
}

/// Parse a complete raw frame window (as accepted by [`FrameVerifier`]).
pub fn parse_frame(window: &[u8]) -> Result<Frame, FrameError> {
    if window.len() < 5 {
        return Err(FrameError::Truncated);
    }
    if window[0] != SOH || window[window.len() - 1] != EOT {
        return Err(FrameError::BadDelimiters);
    }
    let declared = window[1] as usize;
    let body = &window[2..window.len() - 3];
    let mut payload = Vec::with_capacity(declared);
    let mut escape = false;
    for &byte in body {
        if escape {
            payload.push(byte);
            escape = false;
        } else if byte == DLE {
            escape = true;
        } else {
            payload.push(byte);
        }
    }
    if escape || payload.len() != declared {
        return Err(FrameError::BadLength {
            declared,
            actual: payload.len(),
        });
    }
    let seq = window[window.len() - 3];
    let parity = window[window.len() - 2];
    let computed = payload.iter().fold(seq, |acc, b| acc ^ b);
    if computed != parity {
        return Err(FrameError::BadParity { seq });
    }
    Ok(Frame { payload, seq })
}

/// Out-of-band bytes surfaced while scanning for frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Ack,
    Nak(u8),
}

/// Packet verifier for the frame layout, usable with
/// `core_transport::PacketReader`. Bare `ACK`/`NAK reason` sequences between
/// frames are consumed here and published through the shared event queue.
pub struct FrameVerifier {
    events: Rc<RefCell<Vec<LinkEvent>>>,
    awaiting_nak_code: bool,
}

impl FrameVerifier {
    pub fn new() -> (Self, Rc<RefCell<Vec<LinkEvent>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                events: Rc::clone(&events),
                awaiting_nak_code: false,
            },
            events,
        )
    }

    pub fn verify(&mut self, bytes: &[u8], expected: &mut Option<usize>) -> Verify {
        let newest = match bytes.last() {
            Some(b) => *b,
            None => return Verify::Invalid,
        };

        if self.awaiting_nak_code {
            self.awaiting_nak_code = false;
            self.events.borrow_mut().push(LinkEvent::Nak(newest));
            trace!(target: "braille.frame", code = newest, "nak_received");
            return Verify::Ignore;
        }

        if bytes.len() == 1 {
            return match newest {
                SOH => Verify::Include,
                ACK => {
                    self.events.borrow_mut().push(LinkEvent::Ack);
                    trace!(target: "braille.frame", "ack_received");
                    Verify::Ignore
                }
                NAK => {
                    self.awaiting_nak_code = true;
                    Verify::Ignore
                }
                _ => Verify::Invalid,
            };
        }

        // The expected total recomputes from scratch on every byte: header
        // (2) + payload + escapes seen so far + seq + parity + EOT.
        let declared = bytes[1] as usize;
        let escapes = count_payload_escapes(&bytes[2..], declared);
        *expected = Some(2 + declared + escapes + 3);
        Verify::Include
    }
}

/// Count DLE prefixes in the escaped payload region. Counting stops once
/// `declared` payload bytes are accounted for so DLE-valued trailer bytes
/// (seq, parity) are never mistaken for escapes.
fn count_payload_escapes(body: &[u8], declared: usize) -> usize {
    let mut escapes = 0;
    let mut consumed = 0;
    let mut escape = false;
    for &byte in body {
        if consumed >= declared {
            break;
        }
        if escape {
            escape = false;
            consumed += 1;
        } else if byte == DLE {
            escape = true;
            escapes += 1;
        } else {
            consumed += 1;
        }
    }
    escapes
}
