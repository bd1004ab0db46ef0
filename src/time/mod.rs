//! Time management subsystem
//!
//! Tick-based timekeeping: the monotonic tick counter, duration/instant
//! arithmetic, the clock's deadline lists and the software timer service.

pub mod clock;
pub mod timer;

pub use clock::Clock;
pub use timer::{TimerCallback, TimerId, TimerKind};

use core::ops::{Add, AddAssign, Sub};

/// Nominal tick rate of the kernel clock.
pub const TICK_HZ: u64 = 1_000;

/// A point on the monotonic tick clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(pub u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub fn as_ticks(&self) -> u64 {
        self.0
    }
}

/// A span of ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(pub u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn ticks(n: u64) -> Self {
        Self(n)
    }

    /// Convert a millisecond count to ticks, rounding up so a wait is never
    /// shorter than requested. Saturates like the rest of the tick
    /// arithmetic.
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(TICK_HZ).saturating_add(999) / 1_000)
    }

    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(TICK_HZ))
    }

    pub fn as_ticks(&self) -> u64 {
        self.0
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}
