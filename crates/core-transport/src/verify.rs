//! Byte-wise packet acceptance.
//!
//! Frame layouts vary per device, so the transport only runs the loop: it
//! feeds bytes to a caller-provided verifier which accepts or rejects them
//! and announces the expected packet length once it is known. On `Invalid`
//! the attempted window slides by one byte and the retained bytes are
//! replayed through the verifier, so a corrupted stream resynchronizes on
//! the next frame boundary.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{trace, warn};

use crate::endpoint::Endpoint;
use crate::error::TransportError;

/// Verifier decision for the newest byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verify {
    /// The byte belongs to the packet.
    Include,
    /// The byte is consumed but not stored (unstored terminators).
    Exclude,
    /// The byte is out-of-band (e.g. a bare ACK handled by the verifier
    /// itself) and does not disturb the packet in progress.
    Ignore,
    /// The window cannot be a packet: slide one byte and retry.
    Invalid,
}

/// The verifier sees the bytes accepted so far (including the newest) and
/// may set `expected` once the packet length is known. The packet completes
/// when the accepted count reaches `expected`.
pub type Verifier<'a> = &'a mut dyn FnMut(&[u8], &mut Option<usize>) -> Verify;

/// Incremental packet reader; keeps slid-out bytes across calls.
#[derive(Default)]
pub struct PacketReader {
    buffered: VecDeque<u8>,
    packet: Vec<u8>,
    expected: Option<usize>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one packet. `Ok(None)` means the timeout elapsed; a partial
    /// packet is discarded (logged) so the next call starts clean.
    pub fn read(
        &mut self,
        endpoint: &mut dyn Endpoint,
        verifier: Verifier<'_>,
        initial_timeout: Duration,
        subsequent_timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let byte = match self.buffered.pop_front() {
                Some(byte) => byte,
                None => {
                    let timeout = if self.packet.is_empty() {
                        initial_timeout
                    } else {
                        subsequent_timeout
                    };
                    match endpoint.read_byte(Some(timeout))? {
                        Some(byte) => byte,
                        None => {
                            if !self.packet.is_empty() {
                                warn!(
                                    target: "transport.packet",
                                    partial = self.packet.len(),
                                    "partial_packet_discarded"
                                );
                                self.packet.clear();
                                self.expected = None;
                            }
                            return Ok(None);
                        }
                    }
                }
            };

            self.packet.push(byte);
            match verifier(&self.packet, &mut self.expected) {
                Verify::Include => {}
                Verify::Exclude | Verify::Ignore => {
                    self.packet.pop();
                }
                Verify::Invalid => {
                    trace!(target: "transport.packet", window = self.packet.len(), "slide");
                    // Drop the first byte; replay the rest from scratch.
                    let mut retained = std::mem::take(&mut self.packet);
                    retained.remove(0);
                    for b in retained.into_iter().rev() {
                        self.buffered.push_front(b);
                    }
                    self.expected = None;
                    continue;
                }
            }

            if let Some(expected) = self.expected {
                if !self.packet.is_empty() && self.packet.len() >= expected {
                    self.expected = None;
                    return Ok(Some(std::mem::take(&mut self.packet)));
                }
            }
        }
    }
}
