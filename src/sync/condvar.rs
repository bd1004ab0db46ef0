//! Condition variable
//!
//! Waiters atomically release a caller-held mutex and park; signal and
//! broadcast do not wake a waiter directly but move it on to re-acquire that
//! mutex, carrying the condvar outcome for delivery once the mutex is
//! granted. A waiter therefore always holds its mutex again when it resumes,
//! whether the wait ended by signal, timeout or interrupt.
//!
//! Spurious wakeups are permitted by contract: callers re-check their
//! predicate in a loop.

use crate::contract;
use crate::error::{Errno, Outcome, Result};
use crate::kernel::{Kernel, KernelState};
use crate::scheduler::thread::{QueueLink, Tcb, WaitTarget, WakeReason};
use crate::sync::mutex::MutexId;
use crate::time::Duration;
use crate::utils::{Handle, List};
use alloc::boxed::Box;
use alloc::string::String;

/// Handle to a condition variable.
pub type CondvarId = Handle<CondvarRec>;

/// Condition variable record: a priority-ordered wait list and nothing else.
/// The mutex association lives with each waiter, so one condvar may be used
/// with different mutexes over its lifetime (never concurrently).
pub struct CondvarRec {
    pub(crate) name: Box<str>,
    pub(crate) waiters: List<Tcb, QueueLink>,
}

impl KernelState {
    /// Move the head waiter of `cid` on to re-acquiring its mutex.
    fn cv_release_one(&mut self, cid: CondvarId) -> bool {
        let w = match self
            .condvars
            .get_mut(cid)
            .and_then(|cv| cv.waiters.pop_front(&mut self.threads))
        {
            Some(w) => w,
            None => return false,
        };
        let mid = self
            .threads
            .get(w)
            .and_then(|t| t.cv_mutex)
            .expect("condvar waiter without a mutex");
        self.relock_for(mid, w, WakeReason::Normal);
        true
    }
}

impl Kernel {
    pub fn condvar_create(&self, name: &str) -> CondvarId {
        let name: Box<str> = if name.is_empty() {
            Box::from("-")
        } else {
            Box::from(name)
        };
        self.with_state(|st| {
            st.condvars.insert(CondvarRec {
                name,
                waiters: List::new(),
            })
        })
    }

    fn condvar_wait_inner(
        &self,
        cid: CondvarId,
        mid: MutexId,
        timeout: Option<Duration>,
    ) -> Outcome {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return Outcome::Done(contract::violation(
                    "isr",
                    "condvar_wait",
                    Errno::NotPermitted,
                ));
            }
            if st.condvars.get(cid).is_none() {
                return Outcome::Done(Err(Errno::InvalidArgument));
            }
            let tid = st.current;
            let (owner, depth, name) = match st.mutexes.get(mid) {
                Some(mx) => (mx.owner, mx.depth, mx.name.clone()),
                None => return Outcome::Done(Err(Errno::InvalidArgument)),
            };
            if owner != Some(tid) {
                return Outcome::Done(contract::violation(
                    &name,
                    "condvar_wait",
                    Errno::NotPermitted,
                ));
            }
            // A nested recursive hold cannot be released atomically here.
            if depth != 1 {
                return Outcome::Done(contract::violation(
                    &name,
                    "condvar_wait",
                    Errno::InvalidState,
                ));
            }
            if let Err(e) = st.begin_wait() {
                return Outcome::Done(Err(e));
            }
            let deadline = timeout.map(|d| st.clock.deadline_after(d));
            let eff = u64::from(
                st.threads.get(tid).expect("current thread dead").effective_priority,
            );
            st.threads.get_mut(tid).expect("current thread dead").cv_mutex = Some(mid);
            st.condvars
                .get_mut(cid)
                .expect("checked above")
                .waiters
                .insert_descending(&mut st.threads, tid, eff);
            // Park first, then release: the release may grant the mutex and
            // preempt, and by then the waiter must already be linked.
            st.park_no_dispatch(WaitTarget::Condvar(cid), deadline);
            st.mutex_release_for(mid, tid);
            st.preempt_check();
            Outcome::Parked
        })
    }

    /// Atomically release `mid` and wait on `cid`; re-acquires `mid` before
    /// the wait is reported complete. The caller must hold `mid` at depth
    /// one.
    pub fn condvar_wait(&self, cid: CondvarId, mid: MutexId) -> Outcome {
        self.condvar_wait_inner(cid, mid, None)
    }

    /// As [`condvar_wait`], with a relative deadline on the condvar wait.
    /// The mutex re-acquisition after timeout is untimed.
    ///
    /// [`condvar_wait`]: Kernel::condvar_wait
    pub fn condvar_wait_timed(&self, cid: CondvarId, mid: MutexId, timeout: Duration) -> Outcome {
        self.condvar_wait_inner(cid, mid, Some(timeout))
    }

    /// Move the best waiter on to re-acquiring its mutex. No-op without
    /// waiters. Callable from interrupt context.
    pub fn condvar_signal(&self, cid: CondvarId) -> Result<()> {
        self.with_state(|st| {
            if st.condvars.get(cid).is_none() {
                return Err(Errno::InvalidArgument);
            }
            st.cv_release_one(cid);
            Ok(())
        })
    }

    /// Release every waiter. At most one re-acquires the mutex immediately;
    /// the rest queue on it.
    pub fn condvar_broadcast(&self, cid: CondvarId) -> Result<()> {
        self.with_state(|st| {
            if st.condvars.get(cid).is_none() {
                return Err(Errno::InvalidArgument);
            }
            while st.cv_release_one(cid) {}
            Ok(())
        })
    }

    /// Destroy an uncontended condition variable.
    pub fn condvar_delete(&self, cid: CondvarId) -> Result<()> {
        self.with_state(|st| {
            let cv = match st.condvars.get(cid) {
                Some(cv) => cv,
                None => return Err(Errno::InvalidArgument),
            };
            if !cv.waiters.is_empty() {
                return Err(Errno::Busy);
            }
            st.condvars.remove(cid);
            Ok(())
        })
    }

    pub fn condvar_name(&self, cid: CondvarId) -> Result<String> {
        self.with_state(|st| {
            st.condvars
                .get(cid)
                .map(|cv| String::from(&*cv.name))
                .ok_or(Errno::InvalidArgument)
        })
    }
}
