//! Cancel-on-drop alarm ownership.

use std::rc::Rc;
use std::time::Duration;

use crate::scheduler::{AlarmHandle, Scheduler};
use crate::time::TimePoint;

/// An alarm handle that cancels its alarm when dropped. Used for timers whose
/// lifetime is tied to a piece of runtime state (long press, autorelease,
/// acknowledgement timeouts).
pub struct OwnedAlarm {
    sched: Rc<Scheduler>,
    handle: AlarmHandle,
}

impl OwnedAlarm {
    pub fn new(sched: Rc<Scheduler>, handle: AlarmHandle) -> Self {
        Self { sched, handle }
    }

    pub fn handle(&self) -> AlarmHandle {
        self.handle
    }

    pub fn reset_in(&self, delay: Duration) {
        self.sched.reset_alarm_in(self.handle, delay);
    }

    pub fn reset_to(&self, deadline: TimePoint) {
        self.sched.reset_alarm_to(self.handle, deadline);
    }
}

impl Drop for OwnedAlarm {
    fn drop(&mut self) {
        self.sched.cancel_alarm(self.handle);
    }
}
