//! Monotonic tick clock.
//!
//! One tick is a millisecond.  Ticks are measured against
//! [`tokio::time::Instant`] so the async driver can arm timers directly
//! against queue deadlines and paused-clock tests can steer the
//! retransmission schedule.

use std::time::Duration;

use tokio::time::Instant;

pub type Ticks = u64;

pub const TICKS_PER_SECOND: Ticks = 1000;

pub(crate) struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Ticks elapsed since the clock was created.
    pub fn ticks(&self) -> Ticks {
        self.origin.elapsed().as_millis() as Ticks
    }

    /// Instant at which the given tick is reached.
    pub fn instant_at(&self, t: Ticks) -> Instant {
        self.origin + Duration::from_millis(t)
    }
}

pub(crate) fn duration_to_ticks(d: Duration) -> Ticks {
    d.as_millis() as Ticks
}
