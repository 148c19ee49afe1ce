//! core-activity: lifecycle supervision for attachable worker units.
//!
//! An [`Activity`] wraps something that can be started, stopped, and retried:
//! a display driver, the API server, a screen monitor. Its observable state
//! is always one of eleven values; the compound states express a request
//! that arrived while the activity was mid-transition (start callbacks may
//! pump the scheduler, so another callback can ask for a stop while a start
//! is still executing). All transitions run on the scheduler thread, so no
//! two transitions of one activity ever overlap; a secondary request taken
//! during a callback is executed after that callback returns.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use core_sched::{AlarmHandle, Scheduler};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Observable state of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Stopped,
    Preparing,
    /// Preparing, with a stop requested mid-callback.
    PreparingStop,
    Prepared,
    Scheduled,
    Starting,
    /// Starting, with a stop requested mid-callback.
    StartingStop,
    /// Starting, with a stop-then-start requested mid-callback.
    StartingRestart,
    Started,
    Stopping,
    /// Stopping, with a start requested mid-callback.
    StoppingStart,
}

impl ActivityState {
    pub fn is_settled(self) -> bool {
        matches!(self, ActivityState::Stopped | ActivityState::Started)
    }
}

/// Callbacks supplied by the supervised unit. `start` returning `false`
/// leaves the retry alarm armed; it will be called again one interval later.
/// Callbacks must tolerate reentrant `Activity::start`/`Activity::stop`
/// requests made while they run (via nested waits), but are never themselves
/// reentered.
pub trait ActivityMethods {
    fn prepare(&mut self) -> bool {
        true
    }
    fn start(&mut self) -> bool;
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct ActivityDescriptor {
    pub name: &'static str,
    pub retry_interval: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl ActivityDescriptor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            retry_interval: Duration::from_millis(5000),
            start_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(15),
        }
    }

    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    #[must_use]
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The per-activity timeout elapsed before the requested terminal state.
    #[error("activity wait timed out")]
    Timeout,
    /// The activity reached the opposite terminal state instead.
    #[error("activity settled in the opposite state")]
    WrongState,
}

struct Inner {
    state: ActivityState,
    methods: Option<Box<dyn ActivityMethods>>,
    retry_alarm: Option<AlarmHandle>,
}

struct Core {
    descriptor: ActivityDescriptor,
    sched: Rc<Scheduler>,
    inner: RefCell<Inner>,
}

/// Cloneable supervisor handle.
#[derive(Clone)]
pub struct Activity {
    core: Rc<Core>,
}

impl Activity {
    pub fn new(
        sched: Rc<Scheduler>,
        descriptor: ActivityDescriptor,
        methods: impl ActivityMethods + 'static,
    ) -> Self {
        Self {
            core: Rc::new(Core {
                descriptor,
                sched,
                inner: RefCell::new(Inner {
                    state: ActivityState::Stopped,
                    methods: Some(Box::new(methods)),
                    retry_alarm: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.core.descriptor.name
    }

    pub fn state(&self) -> ActivityState {
        self.core.inner.borrow().state
    }

    /// Request activation. Safe to call from any main-loop callback,
    /// including reentrantly while one of this activity's own callbacks runs.
    pub fn start(&self) {
        Core::request_start(&self.core);
    }

    /// Request deactivation, symmetric to [`Activity::start`].
    pub fn stop(&self) {
        Core::request_stop(&self.core);
    }

    /// Pump the scheduler until the activity is started. Times out after the
    /// descriptor's `start_timeout`.
    pub fn await_started(&self) -> Result<(), WaitError> {
        self.await_settled(ActivityState::Started, self.core.descriptor.start_timeout)
    }

    /// Pump the scheduler until the activity is stopped.
    pub fn await_stopped(&self) -> Result<(), WaitError> {
        self.await_settled(ActivityState::Stopped, self.core.descriptor.stop_timeout)
    }

    fn await_settled(&self, wanted: ActivityState, timeout: Duration) -> Result<(), WaitError> {
        let core = Rc::clone(&self.core);
        let met = self
            .core
            .sched
            .await_condition(timeout, || core.inner.borrow().state == wanted);
        if met {
            Ok(())
        } else if self.state().is_settled() {
            Err(WaitError::WrongState)
        } else {
            Err(WaitError::Timeout)
        }
    }

    /// Stop, wait for the terminal state, and release the activity.
    pub fn destroy(self) -> Result<(), WaitError> {
        self.stop();
        let result = self.await_stopped();
        let mut inner = self.core.inner.borrow_mut();
        if let Some(alarm) = inner.retry_alarm.take() {
            self.core.sched.cancel_alarm(alarm);
        }
        inner.methods = None;
        result
    }
}

impl Core {
    fn set_state(&self, next: ActivityState) {
        let mut inner = self.inner.borrow_mut();
        if inner.state != next {
            trace!(
                target: "activity",
                name = self.descriptor.name,
                from = ?inner.state,
                to = ?next,
                "state_change"
            );
            inner.state = next;
        }
    }

    fn request_start(core: &Rc<Core>) {
        let state = core.inner.borrow().state;
        debug!(target: "activity", name = core.descriptor.name, ?state, "start_requested");
        match state {
            ActivityState::Stopped => Core::run_prepare(core),
            // Already heading toward started.
            ActivityState::Preparing
            | ActivityState::Starting
            | ActivityState::StartingRestart
            | ActivityState::Started
            | ActivityState::StoppingStart => {}
            // Withdraw the queued stop.
            ActivityState::PreparingStop => core.set_state(ActivityState::Preparing),
            ActivityState::Prepared => Core::schedule(core),
            ActivityState::Scheduled => {
                let inner = core.inner.borrow();
                if let Some(alarm) = inner.retry_alarm {
                    core.sched.reset_alarm_in(alarm, Duration::ZERO);
                }
            }
            ActivityState::StartingStop => core.set_state(ActivityState::StartingRestart),
            ActivityState::Stopping => core.set_state(ActivityState::StoppingStart),
        }
    }

    fn request_stop(core: &Rc<Core>) {
        let state = core.inner.borrow().state;
        debug!(target: "activity", name = core.descriptor.name, ?state, "stop_requested");
        match state {
            // Already heading toward stopped.
            ActivityState::Stopped
            | ActivityState::PreparingStop
            | ActivityState::StartingStop
            | ActivityState::Stopping => {}
            ActivityState::Preparing => core.set_state(ActivityState::PreparingStop),
            ActivityState::Prepared => core.set_state(ActivityState::Stopped),
            ActivityState::Scheduled => {
                Core::cancel_retry(core);
                core.set_state(ActivityState::Stopped);
            }
            ActivityState::Starting => core.set_state(ActivityState::StartingStop),
            // Downgrade the pending restart to a plain stop.
            ActivityState::StartingRestart => core.set_state(ActivityState::StartingStop),
            ActivityState::Started => Core::run_stop(core),
            ActivityState::StoppingStart => core.set_state(ActivityState::Stopping),
        }
    }

    fn run_prepare(core: &Rc<Core>) {
        core.set_state(ActivityState::Preparing);
        let mut methods = core.inner.borrow_mut().methods.take();
        let prepared = match methods.as_mut() {
            Some(m) => m.prepare(),
            None => false,
        };
        core.inner.borrow_mut().methods = methods;

        let state = core.inner.borrow().state;
        match state {
            ActivityState::PreparingStop => core.set_state(ActivityState::Stopped),
            _ if prepared => {
                core.set_state(ActivityState::Prepared);
                Core::schedule(core);
            }
            _ => {
                warn!(target: "activity", name = core.descriptor.name, "prepare_failed");
                core.set_state(ActivityState::Stopped);
            }
        }
    }

    fn schedule(core: &Rc<Core>) {
        let weak = Rc::downgrade(core);
        let alarm = core.sched.set_alarm_in(Duration::ZERO, move |_| {
            if let Some(core) = weak.upgrade() {
                Core::retry_fired(&core);
            }
        });
        core.sched
            .set_alarm_interval(alarm, Some(core.descriptor.retry_interval));
        let mut inner = core.inner.borrow_mut();
        if let Some(stale) = inner.retry_alarm.replace(alarm) {
            core.sched.cancel_alarm(stale);
        }
        drop(inner);
        core.set_state(ActivityState::Scheduled);
    }

    fn cancel_retry(core: &Rc<Core>) {
        if let Some(alarm) = core.inner.borrow_mut().retry_alarm.take() {
            core.sched.cancel_alarm(alarm);
        }
    }

    fn retry_fired(core: &Rc<Core>) {
        if core.inner.borrow().state != ActivityState::Scheduled {
            return;
        }
        core.set_state(ActivityState::Starting);
        let mut methods = core.inner.borrow_mut().methods.take();
        let started = match methods.as_mut() {
            Some(m) => m.start(),
            None => false,
        };
        core.inner.borrow_mut().methods = methods;

        let state = core.inner.borrow().state;
        if started {
            Core::cancel_retry(core);
            match state {
                ActivityState::StartingStop => {
                    core.set_state(ActivityState::Started);
                    Core::run_stop(core);
                }
                ActivityState::StartingRestart => {
                    core.set_state(ActivityState::Started);
                    Core::run_stop(core);
                    Core::request_start(core);
                }
                _ => {
                    debug!(target: "activity", name = core.descriptor.name, "started");
                    core.set_state(ActivityState::Started);
                }
            }
        } else {
            match state {
                ActivityState::StartingStop => {
                    Core::cancel_retry(core);
                    core.set_state(ActivityState::Stopped);
                }
                _ => {
                    // Includes StartingRestart: the retry alarm stays armed
                    // and the next fire tries again.
                    debug!(target: "activity", name = core.descriptor.name, "start_failed_will_retry");
                    core.set_state(ActivityState::Scheduled);
                }
            }
        }
    }

    fn run_stop(core: &Rc<Core>) {
        core.set_state(ActivityState::Stopping);
        let mut methods = core.inner.borrow_mut().methods.take();
        if let Some(m) = methods.as_mut() {
            m.stop();
        }
        core.inner.borrow_mut().methods = methods;

        let state = core.inner.borrow().state;
        core.set_state(ActivityState::Stopped);
        debug!(target: "activity", name = core.descriptor.name, "stopped");
        if state == ActivityState::StoppingStart {
            Core::request_start(core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    #[derive(Default)]
    struct Script {
        start_results: RefCell<Vec<bool>>,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    struct Scripted {
        script: Rc<Script>,
    }

    impl ActivityMethods for Scripted {
        fn prepare(&mut self) -> bool {
            self.script.log.borrow_mut().push("prepare");
            true
        }
        fn start(&mut self) -> bool {
            self.script.log.borrow_mut().push("start");
            let mut results = self.script.start_results.borrow_mut();
            if results.is_empty() {
                true
            } else {
                results.remove(0)
            }
        }
        fn stop(&mut self) {
            self.script.log.borrow_mut().push("stop");
        }
    }

    fn harness(start_results: Vec<bool>, retry: Duration) -> (Rc<Scheduler>, Activity, Rc<Script>) {
        let sched = Rc::new(Scheduler::new().expect("scheduler"));
        let script = Rc::new(Script {
            start_results: RefCell::new(start_results),
            log: Rc::new(RefCell::new(Vec::new())),
        });
        let activity = Activity::new(
            Rc::clone(&sched),
            ActivityDescriptor::new("test")
                .retry_interval(retry)
                .start_timeout(Duration::from_millis(400))
                .stop_timeout(Duration::from_millis(400)),
            Scripted {
                script: Rc::clone(&script),
            },
        );
        (sched, activity, script)
    }

    #[test]
    fn start_retries_until_the_callback_succeeds() {
        let (_sched, activity, script) =
            harness(vec![false, false, true], Duration::from_millis(100));
        let begun = Instant::now();
        activity.start();
        activity.await_started().expect("third attempt succeeds");
        assert!(begun.elapsed() < Duration::from_millis(400));
        assert_eq!(
            *script.log.borrow(),
            vec!["prepare", "start", "start", "start"]
        );
        assert_eq!(activity.state(), ActivityState::Started);
    }

    #[test]
    fn no_callbacks_fire_after_stop_completes() {
        let (sched, activity, script) = harness(vec![], Duration::from_millis(20));
        activity.start();
        activity.await_started().expect("immediate start");
        activity.stop();
        activity.await_stopped().expect("stop is synchronous here");
        let calls = script.log.borrow().len();
        // Give any stray retry alarm a chance to misfire.
        sched.await_condition(Duration::from_millis(80), || false);
        assert_eq!(script.log.borrow().len(), calls);
        assert_eq!(activity.state(), ActivityState::Stopped);
    }

    #[test]
    fn duplicate_start_requests_are_idempotent() {
        let (_sched, activity, script) = harness(vec![], Duration::from_millis(20));
        activity.start();
        activity.start();
        activity.start();
        activity.await_started().expect("started");
        assert_eq!(*script.log.borrow(), vec!["prepare", "start"]);
    }

    #[test]
    fn stop_while_scheduled_cancels_the_retry() {
        let (sched, activity, script) =
            harness(vec![false, false, false], Duration::from_millis(30));
        activity.start();
        // First attempt fails immediately; the activity is now Scheduled.
        sched.await_condition(Duration::from_millis(10), || {
            activity.state() == ActivityState::Scheduled
        });
        activity.stop();
        assert_eq!(activity.state(), ActivityState::Stopped);
        let calls = script.log.borrow().len();
        sched.await_condition(Duration::from_millis(100), || false);
        assert_eq!(script.log.borrow().len(), calls, "retry alarm kept firing");
    }

    #[test]
    fn await_started_times_out_when_start_keeps_failing() {
        let (_sched, activity, _script) = harness(
            vec![false; 32],
            Duration::from_millis(50),
        );
        activity.start();
        assert_eq!(activity.await_started(), Err(WaitError::Timeout));
    }

    #[test]
    fn stop_requested_during_start_callback_is_honored_afterwards() {
        // The start callback requests a stop of its own activity.
        struct SelfStopping {
            slot: Rc<RefCell<Option<Activity>>>,
            log: Rc<RefCell<Vec<&'static str>>>,
        }
        impl ActivityMethods for SelfStopping {
            fn start(&mut self) -> bool {
                self.log.borrow_mut().push("start");
                if let Some(activity) = self.slot.borrow().as_ref() {
                    activity.stop();
                }
                true
            }
            fn stop(&mut self) {
                self.log.borrow_mut().push("stop");
            }
        }

        let sched = Rc::new(Scheduler::new().expect("scheduler"));
        let slot = Rc::new(RefCell::new(None));
        let log = Rc::new(RefCell::new(Vec::new()));
        let activity = Activity::new(
            Rc::clone(&sched),
            ActivityDescriptor::new("selfstop")
                .retry_interval(Duration::from_millis(20))
                .stop_timeout(Duration::from_millis(200)),
            SelfStopping {
                slot: Rc::clone(&slot),
                log: Rc::clone(&log),
            },
        );
        *slot.borrow_mut() = Some(activity.clone());
        activity.start();
        activity.await_stopped().expect("stop wins");
        assert_eq!(*log.borrow(), vec!["start", "stop"]);
        *slot.borrow_mut() = None;
    }

    #[test]
    fn restart_requested_during_start_failure_keeps_retrying() {
        let (sched, activity, _script) = harness(vec![false, true], Duration::from_millis(30));
        activity.start();
        sched.await_condition(Duration::from_millis(10), || {
            activity.state() == ActivityState::Scheduled
        });
        // stop then start while scheduled: ends up starting again.
        activity.stop();
        activity.start();
        activity.await_started().expect("second schedule succeeds");
    }
}
