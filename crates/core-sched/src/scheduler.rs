//! Cooperative single-threaded scheduler.
//!
//! One `Scheduler` drives the whole daemon: alarms, file-descriptor
//! readiness monitors, cross-thread task injection, and nested condition
//! waits. Every callback registered here runs on the owning thread and runs
//! to completion; suspension happens only inside `await_condition` /
//! `wait_for`. Worker threads never touch scheduler state directly, they
//! post closures through a `TaskSender` whose send also wakes the loop via a
//! self-pipe.
//!
//! Dispatch order inside one pump iteration: due alarms (earliest deadline
//! first, ties by registration order), then injected tasks (only at the
//! outermost wait), then ready I/O. With nothing runnable the loop sleeps in
//! `poll(2)` until the earliest deadline or a pipe wake-up.

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::time::{TimePeriod, TimePoint};

/// Sub-interval used by `wait_for` so alarms keep firing during open-ended
/// waits.
const WAIT_FOR_SLICE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("wake pipe creation failed: {0}")]
    WakePipe(#[source] io::Error),
}

/// Error returned by `TaskSender::send` after the scheduler is gone.
#[derive(Debug, Error)]
#[error("scheduler task channel is disconnected")]
pub struct TaskSendError;

type AlarmCallback = Box<dyn FnMut(&Scheduler)>;
type MonitorCallback = Box<dyn FnMut(&Scheduler)>;
type Task = Box<dyn FnOnce(&Scheduler) + Send>;
type LocalTask = Box<dyn FnOnce(&Scheduler)>;

/// Identity of a scheduled alarm. Non-owning: dropping the handle without
/// `cancel_alarm` leaks only scheduler bookkeeping, never external resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmHandle(u64);

/// Identity of a registered I/O monitor. Same ownership rules as
/// `AlarmHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorDirection {
    Input,
    Output,
}

struct AlarmData {
    callback: Option<AlarmCallback>,
    deadline: TimePoint,
    interval: Option<Duration>,
    /// Bumped on every reschedule; heap entries with a stale generation are
    /// skipped on pop.
    generation: u64,
    cancelled: bool,
}

struct HeapEntry {
    deadline: TimePoint,
    seq: u64,
    id: u64,
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Reversed so the max-heap pops the earliest deadline; ties resolve to
    /// the lower registration sequence.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct MonitorData {
    id: u64,
    fd: RawFd,
    direction: MonitorDirection,
    callback: Option<MonitorCallback>,
    cancelled: bool,
}

#[derive(Default)]
struct Registry {
    alarms: HashMap<u64, AlarmData>,
    heap: BinaryHeap<HeapEntry>,
    monitors: Vec<MonitorData>,
}

impl Registry {
    fn earliest_deadline(&mut self) -> Option<TimePoint> {
        while let Some(top) = self.heap.peek() {
            let live = self
                .alarms
                .get(&top.id)
                .is_some_and(|a| !a.cancelled && a.generation == top.generation);
            if live {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }
}

/// Cross-thread handle for injecting one-shot callbacks onto the main loop.
#[derive(Clone)]
pub struct TaskSender {
    tx: Sender<Task>,
    wake: Arc<File>,
}

impl TaskSender {
    pub fn send(
        &self,
        task: impl FnOnce(&Scheduler) + Send + 'static,
    ) -> Result<(), TaskSendError> {
        self.tx.send(Box::new(task)).map_err(|_| TaskSendError)?;
        // A full pipe already guarantees a pending wake-up.
        match (&*self.wake).write(&[0u8]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(target: "sched.task", error = %e, "wake_write_failed"),
        }
        Ok(())
    }
}

pub struct Scheduler {
    registry: RefCell<Registry>,
    tasks_rx: Receiver<Task>,
    tasks_tx: Sender<Task>,
    local_tasks: RefCell<std::collections::VecDeque<LocalTask>>,
    wake_rx: RefCell<File>,
    wake_tx: Arc<File>,
    next_id: Cell<u64>,
    next_seq: Cell<u64>,
    wait_depth: Cell<usize>,
}

impl Scheduler {
    pub fn new() -> Result<Self, SchedulerError> {
        let (wake_rx, wake_tx) = wake_pipe().map_err(SchedulerError::WakePipe)?;
        let (tasks_tx, tasks_rx) = unbounded();
        Ok(Self {
            registry: RefCell::new(Registry::default()),
            tasks_rx,
            tasks_tx,
            local_tasks: RefCell::new(std::collections::VecDeque::new()),
            wake_rx: RefCell::new(wake_rx),
            wake_tx: Arc::new(wake_tx),
            next_id: Cell::new(1),
            next_seq: Cell::new(1),
            wait_depth: Cell::new(0),
        })
    }

    fn fresh_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn fresh_seq(&self) -> u64 {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        seq
    }

    // ---------------------------------------------------------------------
    // Alarms
    // ---------------------------------------------------------------------

    /// Register a one-shot alarm at an absolute time.
    pub fn set_alarm_at(
        &self,
        deadline: TimePoint,
        callback: impl FnMut(&Scheduler) + 'static,
    ) -> AlarmHandle {
        let id = self.fresh_id();
        let seq = self.fresh_seq();
        let mut reg = self.registry.borrow_mut();
        reg.alarms.insert(
            id,
            AlarmData {
                callback: Some(Box::new(callback)),
                deadline,
                interval: None,
                generation: 0,
                cancelled: false,
            },
        );
        reg.heap.push(HeapEntry {
            deadline,
            seq,
            id,
            generation: 0,
        });
        trace!(target: "sched.alarm", alarm = id, "alarm_set");
        AlarmHandle(id)
    }

    /// Register a one-shot alarm `delay` from now.
    pub fn set_alarm_in(
        &self,
        delay: Duration,
        callback: impl FnMut(&Scheduler) + 'static,
    ) -> AlarmHandle {
        self.set_alarm_at(TimePoint::now() + delay, callback)
    }

    /// Reschedule a pending alarm to an absolute time. No-op for cancelled or
    /// unknown handles.
    pub fn reset_alarm_to(&self, handle: AlarmHandle, deadline: TimePoint) {
        let seq = self.fresh_seq();
        let mut reg = self.registry.borrow_mut();
        if let Some(alarm) = reg.alarms.get_mut(&handle.0) {
            if alarm.cancelled {
                return;
            }
            alarm.deadline = deadline;
            alarm.generation += 1;
            let generation = alarm.generation;
            reg.heap.push(HeapEntry {
                deadline,
                seq,
                id: handle.0,
                generation,
            });
            trace!(target: "sched.alarm", alarm = handle.0, "alarm_reset");
        }
    }

    /// Reschedule a pending alarm relative to now.
    pub fn reset_alarm_in(&self, handle: AlarmHandle, delay: Duration) {
        self.reset_alarm_to(handle, TimePoint::now() + delay);
    }

    /// Convert an alarm to periodic (`Some`) or one-shot (`None`). A periodic
    /// alarm re-arms itself to `fire + interval` after each fire.
    pub fn set_alarm_interval(&self, handle: AlarmHandle, interval: Option<Duration>) {
        let mut reg = self.registry.borrow_mut();
        if let Some(alarm) = reg.alarms.get_mut(&handle.0) {
            if !alarm.cancelled {
                alarm.interval = interval;
            }
        }
    }

    /// Cancel an alarm. Idempotent; the handle is dead afterwards.
    pub fn cancel_alarm(&self, handle: AlarmHandle) {
        let mut reg = self.registry.borrow_mut();
        if let Some(alarm) = reg.alarms.get_mut(&handle.0) {
            alarm.cancelled = true;
            alarm.callback = None;
            trace!(target: "sched.alarm", alarm = handle.0, "alarm_cancelled");
        }
    }

    /// Whether the alarm is still pending (registered and not cancelled).
    pub fn alarm_pending(&self, handle: AlarmHandle) -> bool {
        self.registry
            .borrow()
            .alarms
            .get(&handle.0)
            .is_some_and(|a| !a.cancelled)
    }

    // ---------------------------------------------------------------------
    // I/O monitors
    // ---------------------------------------------------------------------

    /// Run `callback` whenever `fd` is readable. The monitor persists until
    /// cancelled; the fd stays owned by the caller.
    pub fn monitor_input(
        &self,
        fd: RawFd,
        callback: impl FnMut(&Scheduler) + 'static,
    ) -> MonitorHandle {
        self.monitor(fd, MonitorDirection::Input, callback)
    }

    /// Run `callback` whenever `fd` is writable.
    pub fn monitor_output(
        &self,
        fd: RawFd,
        callback: impl FnMut(&Scheduler) + 'static,
    ) -> MonitorHandle {
        self.monitor(fd, MonitorDirection::Output, callback)
    }

    fn monitor(
        &self,
        fd: RawFd,
        direction: MonitorDirection,
        callback: impl FnMut(&Scheduler) + 'static,
    ) -> MonitorHandle {
        let id = self.fresh_id();
        self.registry.borrow_mut().monitors.push(MonitorData {
            id,
            fd,
            direction,
            callback: Some(Box::new(callback)),
            cancelled: false,
        });
        debug!(target: "sched.io", monitor = id, fd, ?direction, "monitor_registered");
        MonitorHandle(id)
    }

    /// Cancel a monitor. Idempotent.
    pub fn cancel_monitor(&self, handle: MonitorHandle) {
        let mut reg = self.registry.borrow_mut();
        if let Some(m) = reg.monitors.iter_mut().find(|m| m.id == handle.0) {
            m.cancelled = true;
            m.callback = None;
            debug!(target: "sched.io", monitor = handle.0, "monitor_cancelled");
        }
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Cloneable, `Send` handle for posting tasks from other threads.
    pub fn task_sender(&self) -> TaskSender {
        TaskSender {
            tx: self.tasks_tx.clone(),
            wake: Arc::clone(&self.wake_tx),
        }
    }

    /// Queue a one-shot callback onto the main loop from the main thread.
    /// Unlike [`TaskSender::send`], the closure may capture non-`Send` state.
    pub fn add_task(&self, task: impl FnOnce(&Scheduler) + 'static) {
        self.local_tasks.borrow_mut().push_back(Box::new(task));
    }

    // ---------------------------------------------------------------------
    // Waits
    // ---------------------------------------------------------------------

    /// Pump the loop until `tester` returns true or `timeout` elapses.
    /// Returns whether the condition was met. Waits nest; injected tasks run
    /// only at depth 1 so they can never re-enter a nested wait.
    pub fn await_condition(&self, timeout: Duration, mut tester: impl FnMut() -> bool) -> bool {
        let period = TimePeriod::starting_now(timeout);
        let depth = self.wait_depth.get() + 1;
        self.wait_depth.set(depth);
        trace!(target: "sched.wait", depth, timeout_ms = timeout.as_millis() as u64, "wait_enter");
        let met = loop {
            if tester() {
                break true;
            }
            let Some(remaining) = period.remaining() else {
                break false;
            };
            self.pump(remaining);
        };
        self.wait_depth.set(depth - 1);
        trace!(target: "sched.wait", depth, met, "wait_leave");
        met
    }

    /// Repeat `await_condition` with a fixed slice until satisfied.
    pub fn wait_for(&self, mut tester: impl FnMut() -> bool) {
        while !self.await_condition(WAIT_FOR_SLICE, &mut tester) {}
    }

    /// One dispatch iteration: due alarms, tasks (outermost wait only), then
    /// I/O, sleeping at most `budget`.
    fn pump(&self, budget: Duration) {
        self.run_due_alarms();
        if self.wait_depth.get() <= 1 {
            self.run_tasks();
        }
        self.poll_io(budget);
    }

    fn run_due_alarms(&self) {
        loop {
            let fired = {
                let mut reg = self.registry.borrow_mut();
                let Some(top) = reg.heap.peek() else { break };
                if !top.deadline.is_due() {
                    break;
                }
                let Some(entry) = reg.heap.pop() else { break };
                let Some(alarm) = reg.alarms.get_mut(&entry.id) else {
                    continue;
                };
                if alarm.cancelled || alarm.generation != entry.generation {
                    if alarm.cancelled {
                        reg.alarms.remove(&entry.id);
                    }
                    continue;
                }
                match alarm.callback.take() {
                    Some(cb) => (entry, cb),
                    None => continue,
                }
            };
            let (entry, mut callback) = fired;
            trace!(target: "sched.alarm", alarm = entry.id, "alarm_fire");
            callback(self);
            let mut reg = self.registry.borrow_mut();
            let Some(alarm) = reg.alarms.get_mut(&entry.id) else {
                continue;
            };
            if alarm.cancelled {
                reg.alarms.remove(&entry.id);
                continue;
            }
            if alarm.generation != entry.generation {
                // The callback rescheduled its own alarm; keep that schedule.
                alarm.callback = Some(callback);
                continue;
            }
            if let Some(interval) = alarm.interval {
                let deadline = entry.deadline + interval;
                alarm.deadline = deadline;
                alarm.generation += 1;
                alarm.callback = Some(callback);
                let generation = alarm.generation;
                let seq = {
                    let seq = self.next_seq.get();
                    self.next_seq.set(seq + 1);
                    seq
                };
                reg.heap.push(HeapEntry {
                    deadline,
                    seq,
                    id: entry.id,
                    generation,
                });
            } else {
                reg.alarms.remove(&entry.id);
            }
        }
    }

    fn run_tasks(&self) {
        loop {
            let task = self.local_tasks.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    trace!(target: "sched.task", "local_task_run");
                    task(self);
                }
                None => break,
            }
        }
        while let Ok(task) = self.tasks_rx.try_recv() {
            trace!(target: "sched.task", "task_run");
            task(self);
        }
    }

    fn tasks_pending(&self) -> bool {
        !self.local_tasks.borrow().is_empty() || !self.tasks_rx.is_empty()
    }

    fn poll_io(&self, budget: Duration) {
        let earliest = self.registry.borrow_mut().earliest_deadline();
        let mut timeout = budget;
        if let Some(deadline) = earliest {
            timeout = timeout.min(deadline.remaining().unwrap_or(Duration::ZERO));
        }
        if self.tasks_pending() && self.wait_depth.get() <= 1 {
            timeout = Duration::ZERO;
        }

        let wake_fd = self.wake_rx.borrow().as_raw_fd();
        let mut ids: Vec<u64> = Vec::new();
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        {
            let reg = self.registry.borrow();
            for m in reg.monitors.iter().filter(|m| !m.cancelled) {
                let events = match m.direction {
                    MonitorDirection::Input => libc::POLLIN,
                    MonitorDirection::Output => libc::POLLOUT,
                };
                ids.push(m.id);
                pollfds.push(libc::pollfd {
                    fd: m.fd,
                    events,
                    revents: 0,
                });
            }
        }
        pollfds.push(libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        });

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        // Single FFI point of the event loop; pollfds outlives the call.
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!(target: "sched.io", error = %err, "poll_failed");
            }
            return;
        }
        if rc == 0 {
            return;
        }

        let wake_ready = pollfds
            .last()
            .is_some_and(|p| p.revents & libc::POLLIN != 0);
        if wake_ready {
            self.drain_wake_pipe();
        }

        let ready: Vec<u64> = ids
            .iter()
            .zip(pollfds.iter())
            .filter(|(_, p)| p.revents & (p.events | libc::POLLHUP | libc::POLLERR) != 0)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            let taken = {
                let mut reg = self.registry.borrow_mut();
                reg.monitors
                    .iter_mut()
                    .find(|m| m.id == id && !m.cancelled)
                    .and_then(|m| m.callback.take())
            };
            let Some(mut callback) = taken else { continue };
            callback(self);
            let mut reg = self.registry.borrow_mut();
            if let Some(m) = reg.monitors.iter_mut().find(|m| m.id == id) {
                if !m.cancelled {
                    m.callback = Some(callback);
                }
            }
        }
        self.sweep_monitors();
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        let mut pipe = self.wake_rx.borrow_mut();
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "sched.io", error = %e, "wake_drain_failed");
                    break;
                }
            }
        }
    }

    fn sweep_monitors(&self) {
        self.registry
            .borrow_mut()
            .monitors
            .retain(|m| !m.cancelled);
    }
}

fn wake_pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // pipe2 returned valid owned descriptors.
    let read = unsafe { File::from_raw_fd(fds[0]) };
    let write = unsafe { File::from_raw_fd(fds[1]) };
    Ok((read, write))
}
