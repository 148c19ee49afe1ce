//! core-transport: uniform byte-stream access to braille devices.
//!
//! Serial, USB, and Bluetooth endpoints sit behind the [`Endpoint`] trait.
//! This crate ships the serial(tty) back-end and an in-memory loopback used
//! by tests and the loopback driver; USB and Bluetooth stacks plug in behind
//! the same trait from their own back-end crates.

mod endpoint;
mod error;
mod identifier;
mod loopback;
mod serial;
mod verify;

pub use endpoint::{Endpoint, WriteDelay};
pub use error::TransportError;
pub use identifier::{DeviceDescriptor, ResourceIdentifier};
pub use loopback::{LoopbackEndpoint, LoopbackHandle};
pub use serial::SerialEndpoint;
pub use verify::{PacketReader, Verifier, Verify};

/// Open the endpoint named by `identifier`.
pub fn connect(
    identifier: &ResourceIdentifier,
    descriptor: &DeviceDescriptor,
) -> Result<Box<dyn Endpoint>, TransportError> {
    match identifier {
        ResourceIdentifier::Serial { path } => {
            Ok(Box::new(SerialEndpoint::open(path, descriptor.baud)?))
        }
        ResourceIdentifier::Usb { .. } => Err(TransportError::Unsupported("usb")),
        ResourceIdentifier::Bluetooth { .. } => Err(TransportError::Unsupported("bluetooth")),
    }
}
