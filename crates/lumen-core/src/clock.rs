// SPDX-License-Identifier: Apache-2.0

//! Time source for session and transaction deadlines
//!
//! Everything that compares against "now" goes through a [`Clock`] so tests
//! can drive expiry deterministically with [`ManualClock`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_unix(&self) -> i64 {
        self.now().timestamp()
    }

    fn now_nano(&self) -> i64 {
        self.now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    fn add_seconds(&self, base: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
        base + chrono::Duration::seconds(seconds)
    }

    /// A deadline is reached at the instant itself, not after it.
    fn is_expired(&self, deadline: DateTime<Utc>) -> bool {
        self.now() >= deadline
    }

    fn time_until(&self, deadline: DateTime<Utc>) -> Duration {
        (deadline - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Clock pinned at the given unix second.
    pub fn at_unix(seconds: i64) -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(seconds, 0).unwrap_or_default())
    }

    pub fn advance(&self, seconds: i64) {
        let mut now = self.now.lock();
        *now += chrono::Duration::seconds(seconds);
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_is_inclusive() {
        let clock = ManualClock::at_unix(1_000);
        let deadline = clock.add_seconds(clock.now(), 60);

        clock.advance(59);
        assert!(!clock.is_expired(deadline));
        assert_eq!(clock.time_until(deadline), Duration::from_secs(1));

        clock.advance(1);
        assert!(clock.is_expired(deadline));
        assert_eq!(clock.time_until(deadline), Duration::ZERO);
    }

    #[test]
    fn test_unix_and_nano_agree() {
        let clock = ManualClock::at_unix(42);
        assert_eq!(clock.now_unix(), 42);
        assert_eq!(clock.now_nano(), 42_000_000_000);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now_nano();
        let b = clock.now_nano();
        assert!(b >= a);
    }
}
