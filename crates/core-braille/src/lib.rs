//! core-braille: cell rendering, device handshaking, and key fan-in for one
//! attached braille display.

mod ack;
mod buffer;
mod dots;
mod framing;
mod session;

pub use ack::{AckMessage, AckQueue};
pub use buffer::BrailleBuffer;
pub use dots::DotTable;
pub use framing::{
    ACK, DLE, EOT, Frame, FrameError, FrameVerifier, LinkEvent, NAK, SOH, encode_frame, nak,
    parse_frame,
};
pub use session::{
    BrailleSession, KeyEventHook, SessionConfig, SessionError, SessionTimings, msg, report,
};
