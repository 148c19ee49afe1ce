//! The uniform endpoint interface drivers talk through.
//!
//! Reads are non-blocking at the descriptor level; blocking semantics are
//! simulated with `poll(2)` so an endpoint can also be driven from the
//! scheduler by registering its descriptor with an input monitor.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::TransportError;

pub trait Endpoint {
    /// Human-readable endpoint name for logs.
    fn name(&self) -> &str;

    /// Descriptor for scheduler monitor registration, when one exists.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Read one byte. `timeout = None` polls without waiting; otherwise the
    /// call waits up to the timeout. `Ok(None)` means no byte arrived.
    fn read_byte(&mut self, timeout: Option<Duration>) -> Result<Option<u8>, TransportError>;

    /// Write the whole buffer, returning the byte count.
    fn write_data(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Wait until the endpoint is readable. Returns whether input arrived
    /// within the timeout.
    fn await_input(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Read up to `buf.len()` bytes: the first byte is awaited for
    /// `initial_timeout`, every following byte for `subsequent_timeout`.
    /// Returns the number of bytes read.
    fn read_data(
        &mut self,
        buf: &mut [u8],
        initial_timeout: Duration,
        subsequent_timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut count = 0;
        while count < buf.len() {
            let timeout = if count == 0 {
                initial_timeout
            } else {
                subsequent_timeout
            };
            match self.read_byte(Some(timeout))? {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

/// Wait for readability on a raw descriptor.
pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        // One descriptor, bounded timeout.
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

/// Estimates time-on-wire so cell writes can be throttled to what the line
/// can carry.
#[derive(Debug, Clone, Copy)]
pub struct WriteDelay {
    per_byte: Duration,
    debt: Duration,
}

impl WriteDelay {
    /// Ten bits per byte on an 8N1 line.
    pub fn for_baud(baud: u32) -> Self {
        let per_byte = Duration::from_secs_f64(10.0 / baud.max(1) as f64);
        Self {
            per_byte,
            debt: Duration::ZERO,
        }
    }

    pub fn note_write(&mut self, bytes: usize) {
        self.debt += self.per_byte * bytes as u32;
    }

    /// Drain the accumulated delay; the caller sleeps or schedules it.
    pub fn take(&mut self) -> Duration {
        std::mem::replace(&mut self.debt, Duration::ZERO)
    }

    pub fn pending(&self) -> Duration {
        self.debt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_delay_accumulates_per_byte_cost() {
        let mut delay = WriteDelay::for_baud(9600);
        delay.note_write(96); // 960 bits ≈ 100 ms at 9600 baud
        let debt = delay.pending();
        assert!(debt >= Duration::from_millis(99) && debt <= Duration::from_millis(101));
        assert_eq!(delay.take(), debt);
        assert_eq!(delay.pending(), Duration::ZERO);
    }
}
