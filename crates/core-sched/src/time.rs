//! Monotonic time primitives shared by the scheduler and its clients.
//!
//! `TimePoint` wraps `std::time::Instant`; everything that schedules or
//! measures in this workspace goes through it so wall-clock adjustments can
//! never skew alarms. `TimePeriod` is the "has T elapsed since start" helper
//! used by condition waits, ack timeouts, and retry bookkeeping.

use std::ops::Add;
use std::time::{Duration, Instant};

/// A monotonic instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimePoint(Instant);

impl TimePoint {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Duration elapsed since this point, zero if it lies in the future.
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    /// Duration from `earlier` to `self`, zero when `earlier` is later.
    pub fn saturating_since(&self, earlier: TimePoint) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    /// Duration until this point from now, `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.checked_duration_since(Instant::now())
    }

    pub fn is_due(&self) -> bool {
        self.0 <= Instant::now()
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 + rhs)
    }
}

/// A `(start, length)` pair for elapsed-time tests.
#[derive(Debug, Clone, Copy)]
pub struct TimePeriod {
    start: TimePoint,
    length: Duration,
}

impl TimePeriod {
    pub fn starting_now(length: Duration) -> Self {
        Self {
            start: TimePoint::now(),
            length,
        }
    }

    pub fn start(&self) -> TimePoint {
        self.start
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn deadline(&self) -> TimePoint {
        self.start + self.length
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.length
    }

    /// Budget left before expiry; `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let used = self.start.elapsed();
        if used >= self.length {
            None
        } else {
            Some(self.length - used)
        }
    }

    /// Restart the period from the current instant, keeping its length.
    pub fn restart(&mut self) {
        self.start = TimePoint::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_period_is_immediately_expired() {
        let p = TimePeriod::starting_now(Duration::ZERO);
        assert!(p.expired());
        assert_eq!(p.remaining(), None);
    }

    #[test]
    fn long_period_reports_remaining_budget() {
        let p = TimePeriod::starting_now(Duration::from_secs(3600));
        assert!(!p.expired());
        let remaining = p.remaining().expect("fresh period must have budget");
        assert!(remaining <= Duration::from_secs(3600));
        assert!(remaining > Duration::from_secs(3599));
    }

    #[test]
    fn restart_extends_an_expired_period() {
        let mut p = TimePeriod::starting_now(Duration::ZERO);
        assert!(p.expired());
        p.length = Duration::from_secs(60);
        p.restart();
        assert!(!p.expired());
    }

    #[test]
    fn time_point_ordering_is_monotonic() {
        let a = TimePoint::now();
        let b = a + Duration::from_millis(5);
        assert!(b > a);
        assert_eq!(b.saturating_since(a), Duration::from_millis(5));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }
}
