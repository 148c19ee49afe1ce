//! core-reports: typed publish/subscribe bus for internal daemon events.
//!
//! Identifiers form a closed enumeration; payloads are carried by [`Report`]
//! variants. Delivery is synchronous on the main loop in registration order.
//! A listener may publish further reports from inside its callback; those
//! nested reports are delivered before `report` returns to the outer caller,
//! except to the listener currently executing (its slot is empty while it
//! runs).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use tracing::{debug, trace};

/// Closed set of report identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportId {
    BrailleDeviceOnline,
    BrailleDeviceOffline,
    BrailleKeyEvent,
    BrailleWindowUpdated,
    CommandRejected,
    ApiClientConnected,
    ApiClientDisconnected,
    ParameterUpdated,
}

/// A report with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    BrailleDeviceOnline { driver: &'static str },
    BrailleDeviceOffline { driver: &'static str },
    BrailleKeyEvent { group: u8, number: u16, pressed: bool },
    BrailleWindowUpdated { cell_count: usize },
    CommandRejected { command: u64 },
    ApiClientConnected { session: u64 },
    ApiClientDisconnected { session: u64 },
    ParameterUpdated { parameter: u32, version: u64 },
}

impl Report {
    pub fn id(&self) -> ReportId {
        match self {
            Report::BrailleDeviceOnline { .. } => ReportId::BrailleDeviceOnline,
            Report::BrailleDeviceOffline { .. } => ReportId::BrailleDeviceOffline,
            Report::BrailleKeyEvent { .. } => ReportId::BrailleKeyEvent,
            Report::BrailleWindowUpdated { .. } => ReportId::BrailleWindowUpdated,
            Report::CommandRejected { .. } => ReportId::CommandRejected,
            Report::ApiClientConnected { .. } => ReportId::ApiClientConnected,
            Report::ApiClientDisconnected { .. } => ReportId::ApiClientDisconnected,
            Report::ParameterUpdated { .. } => ReportId::ParameterUpdated,
        }
    }
}

/// Identity of a registered listener; unregistration is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    id: ReportId,
    serial: u64,
}

struct ListenerEntry {
    serial: u64,
    // None while the callback executes or after unregistration.
    callback: Option<Box<dyn FnMut(&Report)>>,
    removed: bool,
}

#[derive(Default)]
pub struct ReportBus {
    listeners: RefCell<HashMap<ReportId, Vec<ListenerEntry>>>,
    next_serial: Cell<u64>,
}

impl ReportBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener(
        &self,
        id: ReportId,
        callback: impl FnMut(&Report) + 'static,
    ) -> ListenerHandle {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        self.listeners
            .borrow_mut()
            .entry(id)
            .or_default()
            .push(ListenerEntry {
                serial,
                callback: Some(Box::new(callback)),
                removed: false,
            });
        debug!(target: "reports", ?id, serial, "listener_registered");
        ListenerHandle { id, serial }
    }

    pub fn unregister_listener(&self, handle: ListenerHandle) {
        let mut listeners = self.listeners.borrow_mut();
        if let Some(slot) = listeners.get_mut(&handle.id) {
            if let Some(entry) = slot.iter_mut().find(|e| e.serial == handle.serial) {
                entry.removed = true;
                entry.callback = None;
                debug!(target: "reports", id = ?handle.id, serial = handle.serial, "listener_unregistered");
            }
        }
    }

    /// Deliver `report` to every listener of its id, in registration order.
    pub fn report(&self, report: &Report) {
        let id = report.id();
        trace!(target: "reports", ?id, "report_deliver");
        let serials: Vec<u64> = {
            let listeners = self.listeners.borrow();
            listeners
                .get(&id)
                .map(|slot| {
                    slot.iter()
                        .filter(|e| !e.removed)
                        .map(|e| e.serial)
                        .collect()
                })
                .unwrap_or_default()
        };
        for serial in serials {
            let taken = {
                let mut listeners = self.listeners.borrow_mut();
                listeners.get_mut(&id).and_then(|slot| {
                    slot.iter_mut()
                        .find(|e| e.serial == serial && !e.removed)
                        .and_then(|e| e.callback.take())
                })
            };
            let Some(mut callback) = taken else { continue };
            callback(report);
            let mut listeners = self.listeners.borrow_mut();
            if let Some(entry) = listeners
                .get_mut(&id)
                .and_then(|slot| slot.iter_mut().find(|e| e.serial == serial))
            {
                if !entry.removed {
                    entry.callback = Some(callback);
                }
            }
        }
        if let Some(slot) = self.listeners.borrow_mut().get_mut(&id) {
            slot.retain(|e| !e.removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = ReportBus::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = Rc::clone(&order);
            bus.register_listener(ReportId::BrailleDeviceOnline, move |_| {
                order.borrow_mut().push(label)
            });
        }
        bus.report(&Report::BrailleDeviceOnline { driver: "generic" });
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn unregister_is_idempotent_and_stops_delivery() {
        let bus = ReportBus::new();
        let hits = Rc::new(RefCell::new(0u32));
        let handle = {
            let hits = Rc::clone(&hits);
            bus.register_listener(ReportId::CommandRejected, move |_| {
                *hits.borrow_mut() += 1
            })
        };
        bus.report(&Report::CommandRejected { command: 7 });
        bus.unregister_listener(handle);
        bus.unregister_listener(handle);
        bus.report(&Report::CommandRejected { command: 7 });
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn listener_only_sees_matching_report_id() {
        let bus = ReportBus::new();
        let hits = Rc::new(RefCell::new(0u32));
        {
            let hits = Rc::clone(&hits);
            bus.register_listener(ReportId::BrailleKeyEvent, move |report| {
                assert!(matches!(report, Report::BrailleKeyEvent { .. }));
                *hits.borrow_mut() += 1;
            });
        }
        bus.report(&Report::BrailleDeviceOffline { driver: "generic" });
        bus.report(&Report::BrailleKeyEvent {
            group: 0,
            number: 3,
            pressed: true,
        });
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn nested_reports_are_delivered_synchronously() {
        let bus = Rc::new(ReportBus::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let bus = Rc::clone(&bus);
            let log = Rc::clone(&log);
            bus.clone()
                .register_listener(ReportId::BrailleDeviceOnline, move |_| {
                    log.borrow_mut().push("online");
                    bus.report(&Report::BrailleWindowUpdated { cell_count: 40 });
                    log.borrow_mut().push("online_done");
                });
        }
        {
            let log = Rc::clone(&log);
            bus.register_listener(ReportId::BrailleWindowUpdated, move |_| {
                log.borrow_mut().push("window")
            });
        }
        bus.report(&Report::BrailleDeviceOnline { driver: "generic" });
        assert_eq!(*log.borrow(), vec!["online", "window", "online_done"]);
    }

    #[test]
    fn listener_may_unregister_itself_during_delivery() {
        let bus = Rc::new(ReportBus::new());
        let hits = Rc::new(RefCell::new(0u32));
        let slot: Rc<RefCell<Option<ListenerHandle>>> = Rc::new(RefCell::new(None));
        let handle = {
            let bus = Rc::clone(&bus);
            let hits = Rc::clone(&hits);
            let slot = Rc::clone(&slot);
            bus.clone()
                .register_listener(ReportId::ApiClientConnected, move |_| {
                    *hits.borrow_mut() += 1;
                    if let Some(h) = *slot.borrow() {
                        bus.unregister_listener(h);
                    }
                })
        };
        *slot.borrow_mut() = Some(handle);
        bus.report(&Report::ApiClientConnected { session: 1 });
        bus.report(&Report::ApiClientConnected { session: 2 });
        assert_eq!(*hits.borrow(), 1);
    }
}
