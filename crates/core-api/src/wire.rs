//! Typed messages on top of the packet framing.
//!
//! Multi-byte integers are network byte order throughout. The 64-bit key
//! code travels as two big-endian u32 halves, most significant first: flag
//! modifiers in bits 63..=32, a type tag in 31..=29, the block (or driver
//! key group) in 28..=16, and the operand in 15..=0.

use thiserror::Error;

use core_commands::Command;
use core_keytable::KeyValue;

/// Protocol version exchanged at session start.
pub const PROTOCOL_VERSION: u32 = 8;

/// Message type codes.
pub mod kind {
    pub const VERSION: u32 = 0;
    pub const AUTH: u32 = 1;
    pub const GET_DRIVER_NAME: u32 = 2;
    pub const GET_MODEL_ID: u32 = 3;
    pub const GET_DISPLAY_SIZE: u32 = 4;
    pub const ENTER_TTY_MODE: u32 = 5;
    pub const SET_FOCUS: u32 = 6;
    pub const LEAVE_TTY_MODE: u32 = 7;
    pub const KEY: u32 = 8;
    pub const IGNORE_KEY_RANGES: u32 = 9;
    pub const ACCEPT_KEY_RANGES: u32 = 10;
    pub const WRITE: u32 = 11;
    pub const ENTER_RAW_MODE: u32 = 12;
    pub const LEAVE_RAW_MODE: u32 = 13;
    pub const PACKET: u32 = 14;
    pub const SUSPEND_DRIVER: u32 = 15;
    pub const RESUME_DRIVER: u32 = 16;
    pub const PARAM_VALUE: u32 = 17;
    pub const PARAM_REQUEST: u32 = 18;
    pub const SYNCHRONIZE: u32 = 19;
    pub const ACK: u32 = 20;
    pub const ERROR: u32 = 21;
    pub const EXCEPTION: u32 = 22;

    pub fn name(kind: u32) -> &'static str {
        match kind {
            VERSION => "Version",
            AUTH => "Auth",
            GET_DRIVER_NAME => "GetDriverName",
            GET_MODEL_ID => "GetModelId",
            GET_DISPLAY_SIZE => "GetDisplaySize",
            ENTER_TTY_MODE => "EnterTtyMode",
            SET_FOCUS => "SetFocus",
            LEAVE_TTY_MODE => "LeaveTtyMode",
            KEY => "Key",
            IGNORE_KEY_RANGES => "IgnoreKeyRanges",
            ACCEPT_KEY_RANGES => "AcceptKeyRanges",
            WRITE => "Write",
            ENTER_RAW_MODE => "EnterRawMode",
            LEAVE_RAW_MODE => "LeaveRawMode",
            PACKET => "Packet",
            SUSPEND_DRIVER => "SuspendDriver",
            RESUME_DRIVER => "ResumeDriver",
            PARAM_VALUE => "ParamValue",
            PARAM_REQUEST => "ParamRequest",
            SYNCHRONIZE => "Synchronize",
            ACK => "Ack",
            ERROR => "Error",
            EXCEPTION => "Exception",
            _ => "Unknown",
        }
    }
}

/// Wire error codes (see the error-kind taxonomy in the server).
pub mod error_code {
    pub const INVALID_INPUT: u32 = 1;
    pub const NOT_AUTHORIZED: u32 = 2;
    pub const INVALID_STATE: u32 = 3;
    pub const BUSY: u32 = 4;
    pub const IO: u32 = 5;
    pub const TIMEOUT: u32 = 6;
    pub const UNSUPPORTED: u32 = 7;
    pub const FATAL: u32 = 8;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated {what}")]
    Truncated { what: &'static str },
    #[error("malformed {what}")]
    Malformed { what: &'static str },
}

// ---------------------------------------------------------------------------
// Key codes
// ---------------------------------------------------------------------------

/// Type tag for commands forwarded to clients.
pub const KEY_TYPE_COMMAND: u64 = 0b001 << 29;
/// Type tag for raw driver keys.
pub const KEY_TYPE_DRIVER: u64 = 0b010 << 29;
/// Release-edge flag (bit 32, lowest flag bit).
pub const KEY_FLAG_RELEASE: u64 = 1 << 32;

/// Encode a raw driver key for tty-mode clients.
pub fn driver_key_code(key: KeyValue, pressed: bool) -> u64 {
    let mut code = KEY_TYPE_DRIVER | ((key.group as u64) << 16) | key.number as u64;
    if !pressed {
        code |= KEY_FLAG_RELEASE;
    }
    code
}

/// Encode a dispatched command for clients that asked for commands.
pub fn command_key_code(command: Command) -> u64 {
    ((command.flags().bits() as u64) << 32) | KEY_TYPE_COMMAND | command.code() as u64
}

/// Split into the two big-endian u32 halves the wire carries.
pub fn encode_key_code(code: u64) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&((code >> 32) as u32).to_be_bytes());
    out[4..].copy_from_slice(&(code as u32).to_be_bytes());
    out
}

pub fn decode_key_code(bytes: &[u8]) -> Result<u64, WireError> {
    let halves: [u8; 8] = bytes
        .try_into()
        .map_err(|_| WireError::Truncated { what: "key code" })?;
    let hi = u32::from_be_bytes([halves[0], halves[1], halves[2], halves[3]]) as u64;
    let lo = u32::from_be_bytes([halves[4], halves[5], halves[6], halves[7]]) as u64;
    Ok((hi << 32) | lo)
}

// ---------------------------------------------------------------------------
// Key ranges
// ---------------------------------------------------------------------------

/// `(first, last, mask)` triple; the mask names don't-care bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub first: u64,
    pub last: u64,
    pub mask: u64,
}

impl KeyRange {
    /// Containment with masked-out bits ignored.
    pub fn matches(&self, code: u64) -> bool {
        let masked = code & !self.mask;
        masked >= (self.first & !self.mask) && masked <= (self.last & !self.mask)
    }
}

pub fn parse_key_ranges(payload: &[u8]) -> Result<Vec<KeyRange>, WireError> {
    if payload.len() % 24 != 0 {
        return Err(WireError::Malformed { what: "key ranges" });
    }
    payload
        .chunks_exact(24)
        .map(|chunk| {
            Ok(KeyRange {
                first: decode_key_code(&chunk[0..8])?,
                last: decode_key_code(&chunk[8..16])?,
                mask: decode_key_code(&chunk[16..24])?,
            })
        })
        .collect()
}

pub fn encode_key_ranges(ranges: &[KeyRange]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ranges.len() * 24);
    for range in ranges {
        out.extend_from_slice(&encode_key_code(range.first));
        out.extend_from_slice(&encode_key_code(range.last));
        out.extend_from_slice(&encode_key_code(range.mask));
    }
    out
}

// ---------------------------------------------------------------------------
// Tty paths
// ---------------------------------------------------------------------------

/// `[count:u32][count × u32]` — a path down the tty tree.
pub fn parse_tty_path(payload: &[u8]) -> Result<Vec<u32>, WireError> {
    if payload.len() < 4 {
        return Err(WireError::Truncated { what: "tty path" });
    }
    let count = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let body = &payload[4..];
    if body.len() != count * 4 {
        return Err(WireError::Malformed { what: "tty path" });
    }
    Ok(body
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn encode_tty_path(path: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + path.len() * 4);
    out.extend_from_slice(&(path.len() as u32).to_be_bytes());
    for id in path {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// Write requests
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFields: u32 {
        const REGION  = 1 << 0;
        const TEXT    = 1 << 1;
        const AND     = 1 << 2;
        const OR      = 1 << 3;
        const CURSOR  = 1 << 4;
        const CHARSET = 1 << 5;
    }
}

/// The server composes cells as
/// `(translate(text) AND and_mask) OR or_mask` over the addressed region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteRequest {
    pub region_begin: Option<u32>,
    pub region_size: Option<u32>,
    pub text: Option<String>,
    pub and_mask: Option<Vec<u8>>,
    pub or_mask: Option<Vec<u8>>,
    /// 0 = no cursor, 1-based cell index otherwise.
    pub cursor: Option<u32>,
    pub charset: Option<String>,
}

impl WriteRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut fields = WriteFields::empty();
        let mut body = Vec::new();
        if let (Some(begin), Some(size)) = (self.region_begin, self.region_size) {
            fields |= WriteFields::REGION;
            body.extend_from_slice(&begin.to_be_bytes());
            body.extend_from_slice(&size.to_be_bytes());
        }
        if let Some(text) = &self.text {
            fields |= WriteFields::TEXT;
            body.extend_from_slice(&(text.len() as u32).to_be_bytes());
            body.extend_from_slice(text.as_bytes());
        }
        if let Some(and) = &self.and_mask {
            fields |= WriteFields::AND;
            body.extend_from_slice(&(and.len() as u32).to_be_bytes());
            body.extend_from_slice(and);
        }
        if let Some(or) = &self.or_mask {
            fields |= WriteFields::OR;
            body.extend_from_slice(&(or.len() as u32).to_be_bytes());
            body.extend_from_slice(or);
        }
        if let Some(cursor) = self.cursor {
            fields |= WriteFields::CURSOR;
            body.extend_from_slice(&cursor.to_be_bytes());
        }
        if let Some(charset) = &self.charset {
            fields |= WriteFields::CHARSET;
            body.extend_from_slice(&(charset.len() as u32).to_be_bytes());
            body.extend_from_slice(charset.as_bytes());
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&fields.bits().to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(payload);
        let fields = WriteFields::from_bits_truncate(cursor.u32("write fields")?);
        let mut request = WriteRequest::default();
        if fields.contains(WriteFields::REGION) {
            request.region_begin = Some(cursor.u32("region begin")?);
            request.region_size = Some(cursor.u32("region size")?);
        }
        if fields.contains(WriteFields::TEXT) {
            request.text = Some(cursor.string("write text")?);
        }
        if fields.contains(WriteFields::AND) {
            request.and_mask = Some(cursor.bytes_block("and mask")?);
        }
        if fields.contains(WriteFields::OR) {
            request.or_mask = Some(cursor.bytes_block("or mask")?);
        }
        if fields.contains(WriteFields::CURSOR) {
            request.cursor = Some(cursor.u32("write cursor")?);
        }
        if fields.contains(WriteFields::CHARSET) {
            request.charset = Some(cursor.string("charset")?);
        }
        cursor.expect_end("write request")?;
        Ok(request)
    }
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        if self.rest.len() < 4 {
            return Err(WireError::Truncated { what });
        }
        let (head, rest) = self.rest.split_at(4);
        self.rest = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    fn bytes_block(&mut self, what: &'static str) -> Result<Vec<u8>, WireError> {
        let len = self.u32(what)? as usize;
        if self.rest.len() < len {
            return Err(WireError::Truncated { what });
        }
        let (head, rest) = self.rest.split_at(len);
        self.rest = rest;
        Ok(head.to_vec())
    }

    fn string(&mut self, what: &'static str) -> Result<String, WireError> {
        let bytes = self.bytes_block(what)?;
        String::from_utf8(bytes).map_err(|_| WireError::Malformed { what })
    }

    fn expect_end(&self, what: &'static str) -> Result<(), WireError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(WireError::Malformed { what })
        }
    }
}

// ---------------------------------------------------------------------------
// Error payloads
// ---------------------------------------------------------------------------

pub fn encode_error(code: u32, in_reply_to: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&in_reply_to.to_be_bytes());
    out
}
