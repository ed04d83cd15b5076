//! Timestamp sources for the window counter.
//!
//! Events are scored with nanoseconds since the Unix epoch, so every
//! process sharing a store must read from a wall clock. Tests drive time
//! through [`ManualClock`] instead.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

/// A source of nanosecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds since the Unix epoch.
    fn now_nanos(&self) -> i64;
}

/// Wall clock that never goes backwards within a process.
///
/// If the system clock is stepped back, readings hold at the last value
/// returned until the wall clock catches up.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        // None only past the year 2262
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same reading, so a store and a counter built from
/// clones of one `ManualClock` always agree on "now".
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock reading `start_nanos`.
    pub fn new(start_nanos: i64) -> Self {
        Self {
            nanos: Arc::new(AtomicI64::new(start_nanos)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_non_decreasing() {
        let clock = SystemClock::new();
        let mut previous = clock.now_nanos();
        for _ in 0..1000 {
            let now = clock.now_nanos();
            assert!(now >= previous);
            previous = now;
        }
    }

    #[test]
    fn test_system_clock_holds_after_backwards_step() {
        let clock = SystemClock::new();
        let future = clock.now_nanos() + 60_000_000_000;
        clock.last.store(future, Ordering::SeqCst);

        assert_eq!(clock.now_nanos(), future);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();

        clock.advance(Duration::from_nanos(500));
        assert_eq!(other.now_nanos(), 1_500);

        other.set(42);
        assert_eq!(clock.now_nanos(), 42);
    }
}
