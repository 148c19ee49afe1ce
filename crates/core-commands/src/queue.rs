//! Prioritized command handler stack.
//!
//! Handlers are logical layers (input-mode modifiers, routing, clipboard,
//! API interception). Dispatch walks the stack top-first until a handler
//! consumes the command; anything unconsumed falls through to the default
//! console handler. An unconsumed command is not an error: it raises a
//! `CommandRejected` report so the UI can play its alert pattern.

use std::cell::RefCell;
use std::rc::Rc;

use core_reports::{Report, ReportBus};
use tracing::{debug, trace};

use crate::code::Command;

type Handler = Box<dyn FnMut(Command) -> bool>;

struct HandlerEntry {
    name: &'static str,
    serial: u64,
    handler: Option<Handler>,
    removed: bool,
}

pub struct CommandQueue {
    // Bottom of the stack is index 0; dispatch walks from the end.
    handlers: RefCell<Vec<HandlerEntry>>,
    next_serial: std::cell::Cell<u64>,
    default_handler: RefCell<Handler>,
    bus: Rc<ReportBus>,
}

impl CommandQueue {
    /// `default_handler` is the console fallback at the bottom of the stack.
    pub fn new(bus: Rc<ReportBus>, default_handler: impl FnMut(Command) -> bool + 'static) -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
            next_serial: std::cell::Cell::new(1),
            default_handler: RefCell::new(Box::new(default_handler)),
            bus,
        }
    }

    /// Push a handler on top of the stack.
    pub fn push_handler(&self, name: &'static str, handler: impl FnMut(Command) -> bool + 'static) {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        self.handlers.borrow_mut().push(HandlerEntry {
            name,
            serial,
            handler: Some(Box::new(handler)),
            removed: false,
        });
        debug!(target: "commands.queue", handler = name, "handler_pushed");
    }

    /// Remove the topmost handler with `name`. Returns whether one existed.
    pub fn pop_handler(&self, name: &'static str) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        if let Some(entry) = handlers
            .iter_mut()
            .rev()
            .find(|e| e.name == name && !e.removed)
        {
            entry.removed = true;
            entry.handler = None;
            debug!(target: "commands.queue", handler = name, "handler_popped");
            true
        } else {
            false
        }
    }

    /// Dispatch one command through the stack.
    pub fn dispatch(&self, command: Command) {
        trace!(target: "commands.queue", command = command.name(), code = command.code(), "dispatch");
        let serials: Vec<u64> = {
            let handlers = self.handlers.borrow();
            handlers
                .iter()
                .rev()
                .filter(|e| !e.removed)
                .map(|e| e.serial)
                .collect()
        };
        for serial in serials {
            let taken = {
                let mut handlers = self.handlers.borrow_mut();
                handlers
                    .iter_mut()
                    .find(|e| e.serial == serial && !e.removed)
                    .and_then(|e| e.handler.take())
            };
            let Some(mut handler) = taken else { continue };
            let consumed = handler(command);
            {
                let mut handlers = self.handlers.borrow_mut();
                if let Some(entry) = handlers.iter_mut().find(|e| e.serial == serial) {
                    if !entry.removed {
                        entry.handler = Some(handler);
                    }
                }
            }
            if consumed {
                self.sweep();
                return;
            }
        }
        self.sweep();
        let consumed = (self.default_handler.borrow_mut())(command);
        if !consumed {
            debug!(target: "commands.queue", command = command.name(), "command_rejected");
            self.bus.report(&Report::CommandRejected {
                command: command.packed(),
            });
        }
    }

    fn sweep(&self) {
        self.handlers.borrow_mut().retain(|e| !e.removed);
    }
}
