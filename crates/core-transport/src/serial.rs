//! Serial (tty) endpoint back-end.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use nix::sys::termios::{self, BaudRate, SetArg};
use tracing::debug;

use crate::endpoint::{Endpoint, WriteDelay, wait_readable};
use crate::error::TransportError;

pub struct SerialEndpoint {
    name: String,
    file: File,
    write_delay: WriteDelay,
}

impl SerialEndpoint {
    pub fn open(path: &Path, baud: u32) -> Result<Self, TransportError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        set_nonblocking(file.as_raw_fd())?;

        let mut tio = termios::tcgetattr(file.as_fd()).map_err(TransportError::Termios)?;
        termios::cfmakeraw(&mut tio);
        let rate = baud_rate(baud)?;
        termios::cfsetspeed(&mut tio, rate).map_err(TransportError::Termios)?;
        termios::tcsetattr(file.as_fd(), SetArg::TCSANOW, &tio)
            .map_err(TransportError::Termios)?;

        debug!(target: "transport.serial", path = %path.display(), baud, "serial_open");
        Ok(Self {
            name: format!("serial:{}", path.display()),
            file,
            write_delay: WriteDelay::for_baud(baud),
        })
    }

    pub fn write_delay(&mut self) -> &mut WriteDelay {
        &mut self.write_delay
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), TransportError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn baud_rate(baud: u32) -> Result<BaudRate, TransportError> {
    match baud {
        1200 => Ok(BaudRate::B1200),
        2400 => Ok(BaudRate::B2400),
        4800 => Ok(BaudRate::B4800),
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        other => Err(TransportError::BadBaud(other)),
    }
}

impl Endpoint for SerialEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }

    fn read_byte(&mut self, timeout: Option<Duration>) -> Result<Option<u8>, TransportError> {
        let mut byte = [0u8; 1];
        loop {
            match self.file.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => match timeout {
                    Some(t) => {
                        if !wait_readable(self.file.as_raw_fd(), t)? {
                            return Ok(None);
                        }
                        // Readable now; retry exactly once more around.
                    }
                    None => return Ok(None),
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.file.write_all(data)?;
        self.write_delay.note_write(data.len());
        Ok(data.len())
    }

    fn await_input(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        Ok(wait_readable(self.file.as_raw_fd(), timeout)?)
    }
}
