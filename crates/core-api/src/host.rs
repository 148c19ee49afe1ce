//! API socket addressing.
//!
//! A host string selects where the server listens: an empty host part means
//! the local Unix socket under the well-known directory, a non-empty host
//! means TCP. The `:N` suffix picks local socket N or TCP port
//! `SOCKET_PORT_BASE + N`; the sum must still fit in sixteen bits.

use std::path::PathBuf;

use thiserror::Error;

/// Base TCP port; instance N listens on `SOCKET_PORT_BASE + N`.
pub const SOCKET_PORT_BASE: u16 = 4101;

/// Well-known directory for local sockets.
pub const SOCKET_DIRECTORY: &str = "/var/lib/braild";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("malformed host instance number: {0}")]
    BadInstance(String),
    #[error("instance number out of range: {0}")]
    InstanceOutOfRange(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSpec {
    Local { path: PathBuf },
    Tcp { host: String, port: u16 },
}

/// Parse `[host][:N]`.
pub fn parse_host(spec: &str) -> Result<HostSpec, HostError> {
    let (host, instance) = match spec.rsplit_once(':') {
        Some((host, n)) => {
            let n: u32 = n
                .parse()
                .map_err(|_| HostError::BadInstance(spec.to_string()))?;
            (host, n)
        }
        None => (spec, 0),
    };
    if host.is_empty() {
        if instance > u16::MAX as u32 {
            return Err(HostError::InstanceOutOfRange(instance));
        }
        Ok(HostSpec::Local {
            path: PathBuf::from(SOCKET_DIRECTORY).join(instance.to_string()),
        })
    } else {
        let port = (SOCKET_PORT_BASE as u32)
            .checked_add(instance)
            .filter(|p| *p <= u16::MAX as u32)
            .ok_or(HostError::InstanceOutOfRange(instance))?;
        Ok(HostSpec::Tcp {
            host: host.to_string(),
            port: port as u16,
        })
    }
}
