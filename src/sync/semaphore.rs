//! Counting semaphore
//!
//! Bounded counter with a priority-ordered wait list. A post with waiters
//! present hands the permit straight to the best waiter instead of touching
//! the counter, so the count never exceeds its bound and a freshly-posted
//! permit cannot be stolen by a later arrival. Posting at the bound reports
//! `Errno::Overflow` and leaves the counter untouched.

use crate::contract;
use crate::error::{Errno, Outcome, Result};
use crate::kernel::{Kernel, KernelState};
use crate::scheduler::thread::{QueueLink, Tcb, WaitTarget, WakeReason};
use crate::time::Duration;
use crate::utils::{Handle, List};
use alloc::boxed::Box;
use alloc::string::String;

/// Handle to a semaphore.
pub type SemaphoreId = Handle<SemaphoreRec>;

/// Semaphore record. Invariant: `0 <= count <= max`.
pub struct SemaphoreRec {
    pub(crate) name: Box<str>,
    pub(crate) count: i32,
    pub(crate) max: i32,
    pub(crate) waiters: List<Tcb, QueueLink>,
}

impl KernelState {
    /// Consume a permit or report that the caller must block.
    fn sem_take(&mut self, sid: SemaphoreId) -> Result<bool> {
        let sem = match self.semaphores.get_mut(sid) {
            Some(s) => s,
            None => return Err(Errno::InvalidArgument),
        };
        if sem.count > 0 {
            sem.count -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn sem_post_impl(&mut self, sid: SemaphoreId) -> Result<()> {
        let next = match self.semaphores.get_mut(sid) {
            Some(sem) => {
                match sem.waiters.pop_front(&mut self.threads) {
                    Some(w) => Some(w),
                    None => {
                        if sem.count >= sem.max {
                            return Err(Errno::Overflow);
                        }
                        sem.count += 1;
                        None
                    }
                }
            }
            None => return Err(Errno::InvalidArgument),
        };
        if let Some(w) = next {
            // Direct hand-off: the permit goes to the waiter, not the
            // counter.
            self.make_ready(w, WakeReason::Normal);
        }
        Ok(())
    }
}

impl Kernel {
    /// Create a semaphore with `initial` permits and an upper bound of
    /// `max`.
    pub fn sem_create(&self, name: &str, initial: i32, max: i32) -> Result<SemaphoreId> {
        if max <= 0 || initial < 0 || initial > max {
            return Err(Errno::InvalidArgument);
        }
        let name: Box<str> = if name.is_empty() {
            Box::from("-")
        } else {
            Box::from(name)
        };
        self.with_state(|st| {
            Ok(st.semaphores.insert(SemaphoreRec {
                name,
                count: initial,
                max,
                waiters: List::new(),
            }))
        })
    }

    fn sem_wait_inner(&self, sid: SemaphoreId, timeout: Option<Duration>) -> Outcome {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return Outcome::Done(contract::violation("isr", "sem_wait", Errno::NotPermitted));
            }
            match st.sem_take(sid) {
                Ok(true) => return Outcome::Done(Ok(())),
                Ok(false) => {}
                Err(e) => return Outcome::Done(Err(e)),
            }
            if let Err(e) = st.begin_wait() {
                return Outcome::Done(Err(e));
            }
            let tid = st.current;
            let deadline = timeout.map(|d| st.clock.deadline_after(d));
            let eff = u64::from(
                st.threads.get(tid).expect("current thread dead").effective_priority,
            );
            st.semaphores
                .get_mut(sid)
                .expect("checked above")
                .waiters
                .insert_descending(&mut st.threads, tid, eff);
            st.park_current(WaitTarget::Semaphore(sid), deadline);
            Outcome::Parked
        })
    }

    /// Take a permit, parking until one is posted.
    pub fn sem_wait(&self, sid: SemaphoreId) -> Outcome {
        self.sem_wait_inner(sid, None)
    }

    /// Take a permit or park until the relative deadline expires.
    pub fn sem_wait_timed(&self, sid: SemaphoreId, timeout: Duration) -> Outcome {
        self.sem_wait_inner(sid, Some(timeout))
    }

    /// Take a permit without blocking; `Errno::Busy` when none is available.
    pub fn sem_try_wait(&self, sid: SemaphoreId) -> Result<()> {
        self.with_state(|st| match st.sem_take(sid)? {
            true => Ok(()),
            false => Err(Errno::Busy),
        })
    }

    /// Post a permit. Callable from interrupt context; the wakeup it causes
    /// is deferred to bracket exit there.
    pub fn sem_post(&self, sid: SemaphoreId) -> Result<()> {
        self.with_state(|st| st.sem_post_impl(sid))
    }

    /// Current permit count.
    pub fn sem_value(&self, sid: SemaphoreId) -> Result<i32> {
        self.with_state(|st| {
            st.semaphores
                .get(sid)
                .map(|s| s.count)
                .ok_or(Errno::InvalidArgument)
        })
    }

    /// Destroy an uncontended semaphore.
    pub fn sem_delete(&self, sid: SemaphoreId) -> Result<()> {
        self.with_state(|st| {
            let sem = match st.semaphores.get(sid) {
                Some(s) => s,
                None => return Err(Errno::InvalidArgument),
            };
            if !sem.waiters.is_empty() {
                return Err(Errno::Busy);
            }
            st.semaphores.remove(sid);
            Ok(())
        })
    }

    pub fn sem_name(&self, sid: SemaphoreId) -> Result<String> {
        self.with_state(|st| {
            st.semaphores
                .get(sid)
                .map(|s| String::from(&*s.name))
                .ok_or(Errno::InvalidArgument)
        })
    }
}
