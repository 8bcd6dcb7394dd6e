//! Injectable time sources.
//!
//! The token buckets and the request stopwatch run on monotonic time, ban
//! deadlines on wall-clock time. Both come from a single [`Clock`] so that
//! tests can substitute a controlled source.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of monotonic instants and wall-clock timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic time, used for refill accounting and request timing.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for ban deadlines.
    fn wall(&self) -> SystemTime;
}

/// The system clock. Default in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to. Test substitute for [`SystemClock`].
#[derive(Debug)]
pub struct ManualClock {
    start_mono: Instant,
    start_wall: SystemTime,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start_mono: Instant::now(),
            // A fixed, millisecond-aligned wall base keeps deadlines exact
            // when they round-trip through epoch milliseconds.
            start_wall: UNIX_EPOCH + Duration::from_secs(1_600_000_000),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move both the monotonic and the wall clock forward.
    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start_mono + *self.offset.lock()
    }

    fn wall(&self) -> SystemTime {
        self.start_wall + *self.offset.lock()
    }
}
