//! Device resource identifiers.
//!
//! A device is named by a string of the form `serial:PATH`, `usb:VID:PID`,
//! or `bluetooth:AA:BB:CC:DD:EE:FF`; the descriptor carries the options the
//! identifier cannot express (baud rate, USB interface, RFCOMM channel).

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceIdentifier {
    Serial { path: PathBuf },
    Usb { vendor: u16, product: u16 },
    Bluetooth { address: [u8; 6] },
}

impl FromStr for ResourceIdentifier {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| TransportError::BadIdentifier(s.to_string()))?;
        match scheme {
            "serial" if !rest.is_empty() => Ok(Self::Serial {
                path: PathBuf::from(rest),
            }),
            "usb" => {
                let (vid, pid) = rest
                    .split_once(':')
                    .ok_or_else(|| TransportError::BadIdentifier(s.to_string()))?;
                let vendor = u16::from_str_radix(vid, 16)
                    .map_err(|_| TransportError::BadIdentifier(s.to_string()))?;
                let product = u16::from_str_radix(pid, 16)
                    .map_err(|_| TransportError::BadIdentifier(s.to_string()))?;
                Ok(Self::Usb { vendor, product })
            }
            "bluetooth" => {
                let mut address = [0u8; 6];
                let octets: Vec<&str> = rest.split(':').collect();
                if octets.len() != 6 {
                    return Err(TransportError::BadIdentifier(s.to_string()));
                }
                for (slot, octet) in address.iter_mut().zip(octets) {
                    *slot = u8::from_str_radix(octet, 16)
                        .map_err(|_| TransportError::BadIdentifier(s.to_string()))?;
                }
                Ok(Self::Bluetooth { address })
            }
            _ => Err(TransportError::BadIdentifier(s.to_string())),
        }
    }
}

/// Device-specific connection options.
#[derive(Debug, Clone, Copy)]
pub struct DeviceDescriptor {
    pub baud: u32,
    pub usb_interface: u8,
    pub bluetooth_channel: u8,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            baud: 9600,
            usb_interface: 0,
            bluetooth_channel: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serial_identifiers_keep_their_path() {
        let id: ResourceIdentifier = "serial:/dev/ttyUSB0".parse().expect("valid");
        assert_eq!(
            id,
            ResourceIdentifier::Serial {
                path: PathBuf::from("/dev/ttyUSB0")
            }
        );
    }

    #[test]
    fn usb_identifiers_parse_hex_vid_pid() {
        let id: ResourceIdentifier = "usb:0403:6001".parse().expect("valid");
        assert_eq!(
            id,
            ResourceIdentifier::Usb {
                vendor: 0x0403,
                product: 0x6001
            }
        );
    }

    #[test]
    fn bluetooth_identifiers_parse_colon_separated_address() {
        let id: ResourceIdentifier = "bluetooth:00:A0:96:1B:2C:3D".parse().expect("valid");
        assert_eq!(
            id,
            ResourceIdentifier::Bluetooth {
                address: [0x00, 0xA0, 0x96, 0x1B, 0x2C, 0x3D]
            }
        );
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        for bad in ["", "serial:", "usb:0403", "bluetooth:00:11", "floppy:/dev/fd0"] {
            assert!(bad.parse::<ResourceIdentifier>().is_err(), "{bad}");
        }
    }
}
