//! In-memory endpoint for tests and the built-in loopback driver.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::TransportError;

#[derive(Default)]
struct LoopbackIo {
    /// Bytes waiting to be read by the endpoint owner.
    input: VecDeque<u8>,
    /// Bytes the endpoint owner wrote.
    output: Vec<u8>,
}

/// Test-side control half: feed input, inspect output.
#[derive(Clone, Default)]
pub struct LoopbackHandle {
    io: Rc<RefCell<LoopbackIo>>,
}

impl LoopbackHandle {
    pub fn inject(&self, bytes: &[u8]) {
        self.io.borrow_mut().input.extend(bytes);
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.io.borrow_mut().output)
    }

    pub fn output_len(&self) -> usize {
        self.io.borrow().output.len()
    }
}

pub struct LoopbackEndpoint {
    io: Rc<RefCell<LoopbackIo>>,
}

impl LoopbackEndpoint {
    /// Create the endpoint plus its control handle.
    pub fn pair() -> (Self, LoopbackHandle) {
        let handle = LoopbackHandle::default();
        (
            Self {
                io: Rc::clone(&handle.io),
            },
            handle,
        )
    }
}

impl Endpoint for LoopbackEndpoint {
    fn name(&self) -> &str {
        "loopback"
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn read_byte(&mut self, _timeout: Option<Duration>) -> Result<Option<u8>, TransportError> {
        // Nothing ever arrives later than "now" on a loopback, so timeouts
        // collapse to an immediate poll.
        Ok(self.io.borrow_mut().input.pop_front())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.io.borrow_mut().output.extend_from_slice(data);
        Ok(data.len())
    }

    fn await_input(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
        Ok(!self.io.borrow().input.is_empty())
    }
}
