//! Kernel clock
//!
//! The monotonic tick counter plus the two deadline lists it drives: threads
//! in timed waits and armed software timers, both sorted ascending by
//! absolute wake tick so advancing the clock only ever inspects list heads.
//! A settable wall-clock offset provides a real-time source; it is metadata
//! only and never drives a wakeup.

use crate::scheduler::thread::{ClockLink, Tcb};
use crate::time::timer::{TimerLink, TimerRec};
use crate::time::{Duration, Instant, TICK_HZ};
use crate::utils::List;

pub struct Clock {
    ticks: u64,

    /// Threads parked with a deadline, ascending by wake tick
    pub(crate) sleepers: List<Tcb, ClockLink>,

    /// Armed timers, ascending by deadline
    pub(crate) timer_deadlines: List<TimerRec, TimerLink>,

    /// Wall-clock seconds corresponding to tick zero
    realtime_offset_secs: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            ticks: 0,
            sleepers: List::new(),
            timer_deadlines: List::new(),
            realtime_offset_secs: 0,
        }
    }

    /// Current tick.
    pub fn now(&self) -> Instant {
        Instant(self.ticks)
    }

    /// Advance by one tick and return the new "now".
    pub(crate) fn step(&mut self) -> Instant {
        self.ticks = self.ticks.wrapping_add(1);
        Instant(self.ticks)
    }

    /// Absolute deadline for a relative wait starting now. Computed once at
    /// wait start so retries and spurious wakes cannot stretch the wait.
    pub fn deadline_after(&self, d: Duration) -> Instant {
        self.now() + d
    }

    /// Wall-clock seconds since the epoch configured by [`set_realtime`].
    ///
    /// [`set_realtime`]: Clock::set_realtime
    pub fn realtime(&self) -> u64 {
        self.realtime_offset_secs + self.ticks / TICK_HZ
    }

    pub fn set_realtime(&mut self, now_secs: u64) {
        self.realtime_offset_secs = now_secs.saturating_sub(self.ticks / TICK_HZ);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_is_monotonic() {
        let mut c = Clock::new();
        assert_eq!(c.now(), Instant(0));
        assert_eq!(c.step(), Instant(1));
        assert_eq!(c.step(), Instant(2));
        assert_eq!(c.now(), Instant(2));
    }

    #[test]
    fn deadline_is_absolute() {
        let mut c = Clock::new();
        c.step();
        c.step();
        assert_eq!(c.deadline_after(Duration::ticks(10)), Instant(12));
    }

    #[test]
    fn realtime_tracks_offset() {
        let mut c = Clock::new();
        for _ in 0..(2 * TICK_HZ) {
            c.step();
        }
        c.set_realtime(1_000_000);
        assert_eq!(c.realtime(), 1_000_000);
        for _ in 0..TICK_HZ {
            c.step();
        }
        assert_eq!(c.realtime(), 1_000_001);
    }
}
