//! Parameter registry.
//!
//! Parameters are typed, versioned values indexed by id (and a sub-parameter
//! index for array-like entries). Integer payloads are network byte order
//! per element; booleans are one byte. Each mutation bumps the entry's
//! version and raises a `ParameterUpdated` report so watch subscriptions can
//! fan the new value out cheaply.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use core_reports::{Report, ReportBus};
use thiserror::Error;
use tracing::debug;

/// Well-known parameter ids.
pub mod id {
    pub const DRIVER_NAME: u32 = 0;
    pub const MODEL_ID: u32 = 1;
    pub const DISPLAY_SIZE: u32 = 2;
    pub const DEVICE_ONLINE: u32 = 3;
    pub const RETRY_INTERVAL: u32 = 4;
    pub const CLIENT_PRIORITY: u32 = 5;
    pub const COMPUTER_BRAILLE_CELL_SIZE: u32 = 6;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParamAttributes: u8 {
        const READABLE  = 1 << 0;
        const WRITABLE  = 1 << 1;
        const WATCHABLE = 1 << 2;
    }
}

bitflags! {
    /// Request flags on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamRequestFlags: u32 {
        /// Applies to the driver rather than this session's view.
        const GLOBAL = 1 << 0;
        /// Subscribe to future changes.
        const WATCH  = 1 << 1;
        /// Set instead of get.
        const SET    = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    Bool(bool),
    Text(String),
    Keycode(u64),
}

impl ParamValue {
    /// Network-byte-order wire form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ParamValue::U8(values) => values.clone(),
            ParamValue::U16(values) => values.iter().flat_map(|v| v.to_be_bytes()).collect(),
            ParamValue::U32(values) => values.iter().flat_map(|v| v.to_be_bytes()).collect(),
            ParamValue::U64(values) => values.iter().flat_map(|v| v.to_be_bytes()).collect(),
            ParamValue::Bool(value) => vec![u8::from(*value)],
            ParamValue::Text(value) => value.as_bytes().to_vec(),
            ParamValue::Keycode(value) => value.to_be_bytes().to_vec(),
        }
    }

    /// Parse a wire payload into the same type as `self`.
    pub fn decode_as(&self, payload: &[u8]) -> Result<ParamValue, ParamError> {
        fn array<const N: usize, T>(
            payload: &[u8],
            from: fn([u8; N]) -> T,
        ) -> Result<Vec<T>, ParamError> {
            if payload.len() % N != 0 {
                return Err(ParamError::BadValue);
            }
            Ok(payload
                .chunks_exact(N)
                .map(|c| {
                    let mut buf = [0u8; N];
                    buf.copy_from_slice(c);
                    from(buf)
                })
                .collect())
        }
        match self {
            ParamValue::U8(_) => Ok(ParamValue::U8(payload.to_vec())),
            ParamValue::U16(_) => Ok(ParamValue::U16(array(payload, u16::from_be_bytes)?)),
            ParamValue::U32(_) => Ok(ParamValue::U32(array(payload, u32::from_be_bytes)?)),
            ParamValue::U64(_) => Ok(ParamValue::U64(array(payload, u64::from_be_bytes)?)),
            ParamValue::Bool(_) => match payload {
                [value] => Ok(ParamValue::Bool(*value != 0)),
                _ => Err(ParamError::BadValue),
            },
            ParamValue::Text(_) => String::from_utf8(payload.to_vec())
                .map(ParamValue::Text)
                .map_err(|_| ParamError::BadValue),
            ParamValue::Keycode(_) => {
                let bytes: [u8; 8] = payload.try_into().map_err(|_| ParamError::BadValue)?;
                Ok(ParamValue::Keycode(u64::from_be_bytes(bytes)))
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown parameter")]
    Unknown,
    #[error("parameter is not readable")]
    NotReadable,
    #[error("parameter is not writable")]
    NotWritable,
    #[error("parameter is not watchable")]
    NotWatchable,
    #[error("malformed parameter value")]
    BadValue,
}

struct ParamEntry {
    attributes: ParamAttributes,
    value: ParamValue,
    version: u64,
}

pub struct ParamRegistry {
    entries: RefCell<HashMap<u32, ParamEntry>>,
    bus: Rc<ReportBus>,
}

impl ParamRegistry {
    pub fn new(bus: Rc<ReportBus>) -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            bus,
        }
    }

    pub fn define(&self, id: u32, attributes: ParamAttributes, value: ParamValue) {
        self.entries.borrow_mut().insert(
            id,
            ParamEntry {
                attributes,
                value,
                version: 1,
            },
        );
    }

    pub fn attributes(&self, id: u32) -> Option<ParamAttributes> {
        self.entries.borrow().get(&id).map(|e| e.attributes)
    }

    pub fn get(&self, id: u32) -> Result<ParamValue, ParamError> {
        let entries = self.entries.borrow();
        let entry = entries.get(&id).ok_or(ParamError::Unknown)?;
        if !entry.attributes.contains(ParamAttributes::READABLE) {
            return Err(ParamError::NotReadable);
        }
        Ok(entry.value.clone())
    }

    pub fn version(&self, id: u32) -> Option<u64> {
        self.entries.borrow().get(&id).map(|e| e.version)
    }

    /// Client-initiated set: honors writability.
    pub fn set_from_wire(&self, id: u32, payload: &[u8]) -> Result<(), ParamError> {
        let value = {
            let entries = self.entries.borrow();
            let entry = entries.get(&id).ok_or(ParamError::Unknown)?;
            if !entry.attributes.contains(ParamAttributes::WRITABLE) {
                return Err(ParamError::NotWritable);
            }
            entry.value.decode_as(payload)?
        };
        self.store(id, value);
        Ok(())
    }

    /// Daemon-side update: bypasses the writability check (the daemon owns
    /// its own state) but still notifies watchers.
    pub fn update(&self, id: u32, value: ParamValue) -> Result<(), ParamError> {
        if !self.entries.borrow().contains_key(&id) {
            return Err(ParamError::Unknown);
        }
        self.store(id, value);
        Ok(())
    }

    fn store(&self, id: u32, value: ParamValue) {
        let version = {
            let mut entries = self.entries.borrow_mut();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            if entry.value == value {
                return;
            }
            entry.value = value;
            entry.version += 1;
            entry.version
        };
        debug!(target: "api.params", parameter = id, version, "parameter_updated");
        self.bus
            .report(&Report::ParameterUpdated { parameter: id, version });
    }
}
