//! Wall-clock and monotonic time sources.
//!
//! Services take an `Arc<dyn Clock>` instead of calling `Utc::now()`
//! directly; tests substitute a [`ManualClock`] and drive window and
//! expiry math deterministically.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Mutex;
use std::time::Instant;

/// Time source used by every component that needs "now".
pub trait Clock: Send + Sync {
    /// Current wall-clock UTC time, millisecond resolution.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic instant for interval measurement.
    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    /// Current wall-clock time as unix epoch milliseconds.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests. Wall time only advances when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at the given epoch-millisecond timestamp.
    pub fn at_millis(millis: i64) -> Self {
        Self {
            now: Mutex::new(
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .unwrap_or_else(Utc::now),
            ),
        }
    }

    /// Start at an arbitrary instant.
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now = *now + by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_is_frozen() {
        let clock = ManualClock::at_millis(1_700_000_000_000);
        assert_eq!(clock.now_millis(), 1_700_000_000_000);
        assert_eq!(clock.now_millis(), 1_700_000_000_000);
    }

    #[test]
    fn manual_clock_advance() {
        let clock = ManualClock::at_millis(0);
        clock.advance(Duration::minutes(15));
        assert_eq!(clock.now_millis(), 15 * 60 * 1000);
    }

    #[test]
    fn manual_clock_set() {
        let clock = ManualClock::at_millis(0);
        let target = Utc.timestamp_millis_opt(42_000).single().unwrap();
        clock.set(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn monotonic_never_goes_backwards() {
        let clock = SystemClock;
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }
}
