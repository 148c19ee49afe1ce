use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed device identifier: {0}")]
    BadIdentifier(String),
    #[error("unsupported endpoint kind: {0}")]
    Unsupported(&'static str),
    #[error("unsupported baud rate: {0}")]
    BadBaud(u32),
    #[error("terminal setup failed: {0}")]
    Termios(#[source] nix::Error),
}
