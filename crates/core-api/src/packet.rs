//! Client wire framing.
//!
//! Every message is `[length:u32 BE][type:u32 BE][payload:length bytes]`.
//! The decoder is an incremental state machine fed whatever the socket
//! yields: header bytes accumulate until eight are in, payload bytes until
//! `length` is satisfied, and an over-long declaration switches to
//! `Discarding`, swallowing the remainder without ever advancing past the
//! declared length.

use tracing::warn;

/// Upper bound on a single message payload.
pub const MAX_PACKET_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: u32, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.kind.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[derive(Debug)]
enum DecodeState {
    Header,
    Content { kind: u32, remaining: usize },
    Discarding { remaining: usize },
}

/// Event produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    Packet(Packet),
    /// A message declared more than `MAX_PACKET_SIZE` bytes; its payload was
    /// dropped.
    Oversize { kind: u32, length: usize },
}

pub struct PacketDecoder {
    state: DecodeState,
    header: [u8; 8],
    header_len: usize,
    payload: Vec<u8>,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
            header: [0; 8],
            header_len: 0,
            payload: Vec::new(),
        }
    }

    /// Feed bytes, returning every completed event in order.
    pub fn push_bytes(&mut self, mut bytes: &[u8]) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        while !bytes.is_empty() {
            match &mut self.state {
                DecodeState::Header => {
                    let take = (8 - self.header_len).min(bytes.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&bytes[..take]);
                    self.header_len += take;
                    bytes = &bytes[take..];
                    if self.header_len < 8 {
                        continue;
                    }
                    self.header_len = 0;
                    let length = u32::from_be_bytes([
                        self.header[0],
                        self.header[1],
                        self.header[2],
                        self.header[3],
                    ]) as usize;
                    let kind = u32::from_be_bytes([
                        self.header[4],
                        self.header[5],
                        self.header[6],
                        self.header[7],
                    ]);
                    if length == 0 {
                        events.push(DecodeEvent::Packet(Packet::new(kind, Vec::new())));
                    } else if length > MAX_PACKET_SIZE {
                        warn!(target: "api.packet", kind, length, "oversize_packet");
                        events.push(DecodeEvent::Oversize { kind, length });
                        self.state = DecodeState::Discarding { remaining: length };
                    } else {
                        self.payload.clear();
                        self.payload.reserve(length);
                        self.state = DecodeState::Content {
                            kind,
                            remaining: length,
                        };
                    }
                }
                DecodeState::Content { kind, remaining } => {
                    let take = (*remaining).min(bytes.len());
                    self.payload.extend_from_slice(&bytes[..take]);
                    *remaining -= take;
                    bytes = &bytes[take..];
                    if *remaining == 0 {
                        let kind = *kind;
                        let payload = std::mem::take(&mut self.payload);
                        self.state = DecodeState::Header;
                        events.push(DecodeEvent::Packet(Packet::new(kind, payload)));
                    }
                }
                DecodeState::Discarding { remaining } => {
                    let take = (*remaining).min(bytes.len());
                    *remaining -= take;
                    bytes = &bytes[take..];
                    if *remaining == 0 {
                        self.state = DecodeState::Header;
                    }
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(bytes: &[u8]) -> Vec<DecodeEvent> {
        PacketDecoder::new().push_bytes(bytes)
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let packet = Packet::new(11, vec![1, 2, 3, 4, 5]);
        let events = decode_all(&packet.encode());
        assert_eq!(events, vec![DecodeEvent::Packet(packet)]);
    }

    #[test]
    fn zero_length_packets_complete_from_the_header_alone() {
        let packet = Packet::new(19, Vec::new());
        let events = decode_all(&packet.encode());
        assert_eq!(events, vec![DecodeEvent::Packet(packet)]);
    }

    #[test]
    fn byte_at_a_time_delivery_reassembles() {
        let packet = Packet::new(8, vec![0xAA; 17]);
        let wire = packet.encode();
        let mut decoder = PacketDecoder::new();
        let mut events = Vec::new();
        for byte in wire {
            events.extend(decoder.push_bytes(&[byte]));
        }
        assert_eq!(events, vec![DecodeEvent::Packet(packet)]);
    }

    #[test]
    fn decoder_never_consumes_past_the_declared_length() {
        let first = Packet::new(1, vec![9; 3]);
        let second = Packet::new(2, vec![7; 2]);
        let mut wire = first.encode();
        wire.extend_from_slice(&second.encode());
        let events = decode_all(&wire);
        assert_eq!(
            events,
            vec![DecodeEvent::Packet(first), DecodeEvent::Packet(second)]
        );
    }

    #[test]
    fn oversize_payloads_are_discarded_then_framing_resumes() {
        let length = MAX_PACKET_SIZE + 1;
        let mut wire = Vec::new();
        wire.extend_from_slice(&(length as u32).to_be_bytes());
        wire.extend_from_slice(&5u32.to_be_bytes());
        wire.extend(std::iter::repeat(0u8).take(length));
        let follow = Packet::new(6, vec![1]);
        wire.extend_from_slice(&follow.encode());

        let events = decode_all(&wire);
        assert_eq!(
            events,
            vec![
                DecodeEvent::Oversize { kind: 5, length },
                DecodeEvent::Packet(follow)
            ]
        );
    }
}
