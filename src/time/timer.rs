//! Software timers
//!
//! One-shot and periodic callbacks scheduled against the tick clock. Expiry
//! is detected inside `tick()`, but callbacks are dispatched from the
//! reserved timer-service thread, so user callback duration never extends
//! interrupt latency.
//!
//! Catch-up policy: **replay**. A periodic timer re-arms to
//! `previous_deadline + period` before its callback is queued, so advancing
//! the clock in a burst past several periods queues one firing per missed
//! period. Firing counts therefore never drift, at the cost of a compressed
//! burst after a stall.

use crate::contract;
use crate::error::{Errno, Result};
use crate::kernel::{Kernel, KernelState};
use crate::time::{Duration, Instant};
use crate::utils::{Adapter, Handle, Link};
use alloc::boxed::Box;
use alloc::string::String;

/// Handle to a software timer.
pub type TimerId = Handle<TimerRec>;

/// Timer callback, run on the timer-service thread. Callbacks may use the
/// kernel's non-blocking operations; blocking from the dispatch context is a
/// contract violation.
pub type TimerCallback = Box<dyn FnMut(&Kernel) + Send>;

/// Run type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then disarms
    OneShot,
    /// Re-arms to `previous_deadline + period` on every expiry
    Periodic,
}

/// Timer record.
pub struct TimerRec {
    pub(crate) name: Box<str>,
    pub(crate) kind: TimerKind,
    pub(crate) period: Duration,
    pub(crate) deadline: Instant,
    pub(crate) armed: bool,
    pub(crate) callback: Option<TimerCallback>,
    pub(crate) link: Link<TimerRec>,
    pub(crate) firings: u64,
}

/// Deadline-list adapter.
pub struct TimerLink;

impl Adapter<TimerRec> for TimerLink {
    fn link(item: &TimerRec) -> &Link<TimerRec> {
        &item.link
    }
    fn link_mut(item: &mut TimerRec) -> &mut Link<TimerRec> {
        &mut item.link
    }
}

impl KernelState {
    /// Collect expired timers at `now`: pre-re-arm periodic ones (replay
    /// policy) and queue a firing per expiry for the timer-service thread.
    pub(crate) fn expire_timers(&mut self, now: Instant) {
        loop {
            let head = match self.clock.timer_deadlines.front_key(&self.timers) {
                Some(key) if key <= now.as_ticks() => self
                    .clock
                    .timer_deadlines
                    .pop_front(&mut self.timers)
                    .expect("non-empty deadline list"),
                _ => break,
            };
            let timer = self.timers.get_mut(head).expect("armed timer vanished");
            timer.firings += 1;
            match timer.kind {
                TimerKind::OneShot => {
                    timer.armed = false;
                }
                TimerKind::Periodic => {
                    // Drift-free: next deadline is relative to the previous
                    // one, not to "now". May still be in the past; the loop
                    // then queues the next replay firing on this same tick.
                    timer.deadline += timer.period;
                    let key = timer.deadline.as_ticks();
                    self.clock
                        .timer_deadlines
                        .insert_ascending(&mut self.timers, head, key);
                }
            }
            self.stats.timer_firings += 1;
            self.timer_pending.push_back(head);
        }
    }

    fn disarm_timer(&mut self, id: TimerId) {
        self.clock.timer_deadlines.remove(&mut self.timers, id);
        if let Some(timer) = self.timers.get_mut(id) {
            timer.armed = false;
        }
        // Drop queued firings that have not been dispatched yet.
        self.timer_pending.retain(|&t| t != id);
    }

    pub(crate) fn timer_start_impl(&mut self, id: TimerId, period: Duration) -> Result<()> {
        if period == Duration::ZERO {
            return Err(Errno::InvalidArgument);
        }
        if self.timers.get(id).is_none() {
            return Err(Errno::InvalidArgument);
        }
        // Re-arming an armed timer replaces its deadline.
        self.disarm_timer(id);
        let deadline = self.clock.deadline_after(period);
        let timer = self.timers.get_mut(id).expect("checked above");
        timer.period = period;
        timer.deadline = deadline;
        timer.armed = true;
        let key = deadline.as_ticks();
        self.clock
            .timer_deadlines
            .insert_ascending(&mut self.timers, id, key);
        log::debug!("timer {:?} armed, deadline tick {}", id, key);
        Ok(())
    }

    pub(crate) fn timer_stop_impl(&mut self, id: TimerId) -> Result<()> {
        let timer = match self.timers.get(id) {
            Some(t) => t,
            None => return Err(Errno::InvalidArgument),
        };
        if !timer.armed {
            let name = timer.name.clone();
            return contract::violation(&name, "timer_stop", Errno::InvalidState);
        }
        self.disarm_timer(id);
        Ok(())
    }
}

impl Kernel {
    /// Create a timer. It starts disarmed; arm it with [`timer_start`].
    ///
    /// [`timer_start`]: Kernel::timer_start
    pub fn timer_create(&self, name: &str, kind: TimerKind, callback: TimerCallback) -> TimerId {
        let name: Box<str> = if name.is_empty() {
            Box::from("-")
        } else {
            Box::from(name)
        };
        self.with_state(|st| {
            st.timers.insert(TimerRec {
                name,
                kind,
                period: Duration::ZERO,
                deadline: Instant::ZERO,
                armed: false,
                callback: Some(callback),
                link: Link::new(),
                firings: 0,
            })
        })
    }

    /// Arm the timer: first expiry after `period`, and for periodic timers
    /// every `period` after that. Re-arming replaces the current deadline.
    pub fn timer_start(&self, id: TimerId, period: Duration) -> Result<()> {
        self.with_state(|st| st.timer_start_impl(id, period))
    }

    /// Disarm the timer and discard any queued, not-yet-dispatched firings.
    pub fn timer_stop(&self, id: TimerId) -> Result<()> {
        self.with_state(|st| st.timer_stop_impl(id))
    }

    /// Re-arm with the period from the previous start.
    pub fn timer_restart(&self, id: TimerId) -> Result<()> {
        self.with_state(|st| {
            let period = match st.timers.get(id) {
                Some(t) => t.period,
                None => return Err(Errno::InvalidArgument),
            };
            st.timer_start_impl(id, period)
        })
    }

    /// Destroy the timer; pending firings are discarded.
    pub fn timer_delete(&self, id: TimerId) -> Result<()> {
        self.with_state(|st| {
            if st.timers.get(id).is_none() {
                return Err(Errno::InvalidArgument);
            }
            st.disarm_timer(id);
            st.timers.remove(id);
            Ok(())
        })
    }

    pub fn timer_is_armed(&self, id: TimerId) -> Result<bool> {
        self.with_state(|st| st.timers.get(id).map(|t| t.armed).ok_or(Errno::InvalidArgument))
    }

    /// Total number of expiries since creation.
    pub fn timer_firings(&self, id: TimerId) -> Result<u64> {
        self.with_state(|st| st.timers.get(id).map(|t| t.firings).ok_or(Errno::InvalidArgument))
    }

    pub fn timer_name(&self, id: TimerId) -> Result<String> {
        self.with_state(|st| {
            st.timers
                .get(id)
                .map(|t| String::from(&*t.name))
                .ok_or(Errno::InvalidArgument)
        })
    }
}
