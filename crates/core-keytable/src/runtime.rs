//! Scheduler-backed key table.
//!
//! `KeyTableRuntime` owns the timers the pure engine asks for and forwards
//! fired commands to its sink (normally `CommandQueue::dispatch`). All alarm
//! handles are cancel-on-drop, so dropping the runtime can never leave a
//! long-press or autorelease timer behind.

use std::cell::RefCell;
use std::rc::Rc;

use core_commands::{Command, CommandFlags};
use core_sched::{OwnedAlarm, Scheduler};
use tracing::debug;

use crate::binding::{KeyTableDef, KeyboardFunction};
use crate::engine::{KeyEffect, KeyTable, KeyTableTimings};
use crate::keys::KeyValue;

type CommandSink = Box<dyn FnMut(Command)>;
type KeyboardSink = Box<dyn FnMut(KeyboardFunction)>;

#[derive(Default)]
struct Alarms {
    long_press: Option<OwnedAlarm>,
    autorepeat: Option<OwnedAlarm>,
    autorelease: Option<OwnedAlarm>,
    sticky: Option<OwnedAlarm>,
}

pub struct KeyTableRuntime {
    sched: Rc<Scheduler>,
    table: RefCell<KeyTable>,
    sink: RefCell<CommandSink>,
    keyboard_sink: RefCell<KeyboardSink>,
    alarms: RefCell<Alarms>,
}

impl KeyTableRuntime {
    pub fn new(
        sched: Rc<Scheduler>,
        def: Rc<KeyTableDef>,
        timings: KeyTableTimings,
        sink: impl FnMut(Command) + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            sched,
            table: RefCell::new(KeyTable::new(def, timings)),
            sink: RefCell::new(Box::new(sink)),
            keyboard_sink: RefCell::new(Box::new(|function| {
                debug!(target: "keytable", ?function, "keyboard_event_unrouted");
            })),
            alarms: RefCell::new(Alarms::default()),
        })
    }

    /// Route synthesized keyboard events (from mapped keys) somewhere, e.g.
    /// the console injector.
    pub fn set_keyboard_sink(&self, sink: impl FnMut(KeyboardFunction) + 'static) {
        *self.keyboard_sink.borrow_mut() = Box::new(sink);
    }

    /// Feed one press/release edge from the driver.
    pub fn process_key_event(self: &Rc<Self>, key: KeyValue, pressed: bool) {
        let effects = self.table.borrow_mut().process_key_event(key, pressed);
        self.apply(effects.into_vec());
    }

    /// Latch a sticky modifier (one-shot unless `persistent`).
    pub fn add_sticky_modifier(self: &Rc<Self>, flag: CommandFlags, persistent: bool) {
        let effects = self.table.borrow_mut().add_sticky_modifier(flag, persistent);
        self.apply(effects.into_vec());
    }

    /// Read-only access to the engine state.
    pub fn snapshot<R>(&self, f: impl FnOnce(&KeyTable) -> R) -> R {
        f(&self.table.borrow())
    }

    fn apply(self: &Rc<Self>, effects: Vec<KeyEffect>) {
        for effect in effects {
            match effect {
                KeyEffect::Dispatch(command) => {
                    self.alarms.borrow_mut().sticky = None;
                    (self.sink.borrow_mut())(command);
                }
                KeyEffect::KeyboardEvent(function) => {
                    (self.keyboard_sink.borrow_mut())(function);
                }
                KeyEffect::ArmLongPress(_) => {
                    let delay = self.table.borrow().timings().long_press;
                    let weak = Rc::downgrade(self);
                    let handle = self.sched.set_alarm_in(delay, move |_| {
                        if let Some(rt) = weak.upgrade() {
                            let fx = rt.table.borrow_mut().long_press_fired();
                            rt.apply(fx.into_vec());
                        }
                    });
                    self.alarms.borrow_mut().long_press =
                        Some(OwnedAlarm::new(Rc::clone(&self.sched), handle));
                }
                KeyEffect::CancelLongPress => {
                    self.alarms.borrow_mut().long_press = None;
                }
                KeyEffect::ArmAutorepeat(_) => {
                    let interval = self.table.borrow().timings().autorepeat_interval;
                    let weak = Rc::downgrade(self);
                    let handle = self.sched.set_alarm_in(interval, move |_| {
                        if let Some(rt) = weak.upgrade() {
                            let fx = rt.table.borrow_mut().autorepeat_fired();
                            rt.apply(fx.into_vec());
                        }
                    });
                    self.sched.set_alarm_interval(handle, Some(interval));
                    self.alarms.borrow_mut().autorepeat =
                        Some(OwnedAlarm::new(Rc::clone(&self.sched), handle));
                }
                KeyEffect::CancelAutorepeat => {
                    self.alarms.borrow_mut().autorepeat = None;
                }
                KeyEffect::ResetAutorelease => {
                    let delay = self.table.borrow().timings().autorelease;
                    let existing = self.alarms.borrow().autorelease.is_some();
                    if existing {
                        if let Some(alarm) = &self.alarms.borrow().autorelease {
                            alarm.reset_in(delay);
                        }
                    } else {
                        let weak = Rc::downgrade(self);
                        let handle = self.sched.set_alarm_in(delay, move |_| {
                            if let Some(rt) = weak.upgrade() {
                                let fx = rt.table.borrow_mut().autorelease_fired();
                                rt.apply(fx.into_vec());
                            }
                        });
                        self.alarms.borrow_mut().autorelease =
                            Some(OwnedAlarm::new(Rc::clone(&self.sched), handle));
                    }
                }
                KeyEffect::CancelAutorelease => {
                    self.alarms.borrow_mut().autorelease = None;
                }
                KeyEffect::ArmStickyTimeout => {
                    let delay = self.table.borrow().timings().sticky_modifiers;
                    let weak = Rc::downgrade(self);
                    let handle = self.sched.set_alarm_in(delay, move |_| {
                        if let Some(rt) = weak.upgrade() {
                            rt.table.borrow_mut().sticky_timeout_fired();
                            rt.alarms.borrow_mut().sticky = None;
                        }
                    });
                    self.alarms.borrow_mut().sticky =
                        Some(OwnedAlarm::new(Rc::clone(&self.sched), handle));
                }
                KeyEffect::CancelStickyTimeout => {
                    self.alarms.borrow_mut().sticky = None;
                }
                KeyEffect::Unbound(key) => {
                    debug!(target: "keytable", ?key, "unbound_key");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindingFlags, KeyBinding, KeyCombination, KeyTableDef};
    use crate::keys::{KeyValue, group};
    use core_commands::basic;
    use std::time::Duration;

    fn nav(n: u16) -> KeyValue {
        KeyValue::new(group::NAV, n)
    }

    fn pan_down_table() -> Rc<KeyTableDef> {
        let mut builder = KeyTableDef::builder();
        let ctx = builder.context("default", None);
        builder.bind(
            ctx,
            KeyBinding::new(KeyCombination::solo(nav(2)), Command::basic(basic::LNDN))
                .with_flags(BindingFlags::LONG_PRESS | BindingFlags::AUTOREPEAT),
        );
        builder.default_context(ctx);
        Rc::new(builder.build())
    }

    fn harness(
        timings: KeyTableTimings,
    ) -> (Rc<Scheduler>, Rc<KeyTableRuntime>, Rc<RefCell<Vec<Command>>>) {
        let sched = Rc::new(Scheduler::new().expect("scheduler"));
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let rt = KeyTableRuntime::new(Rc::clone(&sched), pan_down_table(), timings, move |cmd| {
            sink.borrow_mut().push(cmd)
        });
        (sched, rt, log)
    }

    #[test]
    fn hold_produces_long_press_then_autorepeat_until_release() {
        let timings = KeyTableTimings {
            long_press: Duration::from_millis(60),
            autorepeat_interval: Duration::from_millis(30),
            ..KeyTableTimings::default()
        };
        let (sched, rt, log) = harness(timings);

        rt.process_key_event(nav(2), true);
        assert_eq!(log.borrow().len(), 1, "initial dispatch at press");

        // Long press plus at least two repeats.
        assert!(sched.await_condition(Duration::from_secs(2), || log.borrow().len() >= 4));
        {
            let log = log.borrow();
            assert_eq!(log[0], Command::basic(basic::LNDN));
            assert_eq!(
                log[1],
                Command::basic(basic::LNDN).with_flags(CommandFlags::LONG_PRESS)
            );
            assert_eq!(log[2], Command::basic(basic::LNDN));
        }

        rt.process_key_event(nav(2), false);
        let settled = log.borrow().len();
        assert!(!sched.await_condition(Duration::from_millis(120), || log.borrow().len() > settled));
    }

    #[test]
    fn release_before_long_press_time_cancels_the_timer() {
        let timings = KeyTableTimings {
            long_press: Duration::from_millis(50),
            ..KeyTableTimings::default()
        };
        let (sched, rt, log) = harness(timings);
        rt.process_key_event(nav(2), true);
        rt.process_key_event(nav(2), false);
        assert!(!sched.await_condition(Duration::from_millis(120), || log.borrow().len() > 1));
    }

    #[test]
    fn idle_held_keys_are_autoreleased() {
        let timings = KeyTableTimings {
            long_press: Duration::from_millis(10),
            autorelease: Duration::from_millis(60),
            ..KeyTableTimings::default()
        };
        let (sched, rt, _log) = harness(timings);
        rt.process_key_event(nav(2), true);
        assert!(sched.await_condition(Duration::from_secs(2), || {
            rt.snapshot(|t| t.pressed_keys().is_empty())
        }));
    }

    #[test]
    fn sticky_modifier_expires_without_a_command() {
        let timings = KeyTableTimings {
            sticky_modifiers: Duration::from_millis(40),
            ..KeyTableTimings::default()
        };
        let (sched, rt, log) = harness(timings);
        rt.add_sticky_modifier(CommandFlags::SHIFT, false);
        assert!(sched.await_condition(Duration::from_secs(2), || {
            rt.snapshot(|t| t.sticky_modifiers().1.is_empty())
        }));
        rt.process_key_event(nav(2), true);
        assert_eq!(log.borrow()[0], Command::basic(basic::LNDN));
        rt.process_key_event(nav(2), false);
    }
}
