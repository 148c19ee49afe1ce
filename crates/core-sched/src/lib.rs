//! core-sched: the daemon's cooperative event core.
//!
//! Everything in braild runs on one thread driven by [`Scheduler`]: alarms,
//! fd readiness monitors, injected tasks, and nested condition waits.
//! Auxiliary threads exist only inside [`WorkerPool`] and communicate with
//! the loop exclusively through [`TaskSender`].

mod guard;
mod scheduler;
mod time;
mod worker;

pub use guard::OwnedAlarm;
pub use scheduler::{
    AlarmHandle, MonitorDirection, MonitorHandle, Scheduler, SchedulerError, TaskSendError,
    TaskSender,
};
pub use time::{TimePeriod, TimePoint};
pub use worker::WorkerPool;
