//! Mutex
//!
//! Ownership-tracked lock with three orthogonal attribute axes: kind
//! (normal / error-check / recursive), protocol (none / priority inheritance
//! / priority ceiling) and robustness (stalled / robust). The wait list is
//! priority-ordered, so the highest-priority longest-waiting thread is
//! always granted next.
//!
//! Inheritance boosts the owner to the head waiter's effective priority and
//! propagates along chains of owners blocked on further inheritance mutexes.
//! The ceiling protocol boosts the owner to the configured ceiling for the
//! whole hold. A robust mutex whose owner dies is handed to the next waiter
//! in the inconsistent state; the new owner must acknowledge with
//! [`Kernel::mutex_mark_consistent`] before unlocking, or the mutex becomes
//! permanently unrecoverable.

use crate::contract;
use crate::error::{Errno, Outcome, Result};
use crate::kernel::{Kernel, KernelState};
use crate::scheduler::thread::{priority, QueueLink, Tcb, ThreadId, WaitTarget, WakeReason};
use crate::time::Duration;
use crate::utils::{Arena, Handle, List};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

/// Handle to a mutex.
pub type MutexId = Handle<MutexRec>;

/// Relock behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// Relock by the owner is a contract violation
    #[default]
    Normal,
    /// Relock by the owner reports `Errno::Deadlock`
    ErrorCheck,
    /// Relock by the owner nests; unlock unwinds one level
    Recursive,
}

/// Priority protocol applied while the mutex is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    None,
    /// Owner inherits the effective priority of its best waiter
    Inherit,
    /// Owner runs at the configured ceiling for the whole hold
    Protect { ceiling: u8 },
}

/// Behavior when the owner terminates while holding the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Robustness {
    /// The mutex stays locked forever
    #[default]
    Stalled,
    /// The next waiter is granted ownership with `Errno::OwnerDied`
    Robust,
}

/// Robust-recovery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    #[default]
    Consistent,
    /// An owner died holding the mutex; the protected state needs recovery
    Inconsistent,
    /// An inconsistent mutex was unlocked without acknowledgement
    NotRecoverable,
}

/// Mutex record.
pub struct MutexRec {
    pub(crate) name: Box<str>,
    pub(crate) kind: MutexKind,
    pub(crate) protocol: Protocol,
    pub(crate) robustness: Robustness,
    pub(crate) consistency: Consistency,
    pub(crate) owner: Option<ThreadId>,
    /// Recursion depth; 1 for a plain hold
    pub(crate) depth: u32,
    pub(crate) waiters: List<Tcb, QueueLink>,
}

impl MutexRec {
    pub(crate) fn inherits(&self) -> bool {
        matches!(self.protocol, Protocol::Inherit)
    }

    /// Priority floor this mutex imposes on its owner right now.
    pub(crate) fn boost_for(&self, threads: &Arena<Tcb>) -> u8 {
        match self.protocol {
            Protocol::None => priority::IDLE,
            Protocol::Protect { ceiling } => ceiling,
            Protocol::Inherit => self
                .waiters
                .front()
                .and_then(|h| threads.get(h))
                .map(|t| t.effective_priority)
                .unwrap_or(priority::IDLE),
        }
    }
}

/// Result of a non-blocking acquisition attempt.
enum Attempt {
    /// Ownership taken; the result is `Err(OwnerDied)` when the previous
    /// owner died holding a robust mutex
    Acquired(Result<()>),
    Fail(Errno),
    MustBlock,
}

impl KernelState {
    /// Record `tid` as the owner of `mid`.
    fn grant_mutex(&mut self, mid: MutexId, tid: ThreadId) {
        if let Some(mx) = self.mutexes.get_mut(mid) {
            mx.owner = Some(tid);
            mx.depth = 1;
        }
        if let Some(t) = self.threads.get_mut(tid) {
            t.held_mutexes.push(mid);
        }
    }

    fn mutex_acquire_attempt(&mut self, mid: MutexId, tid: ThreadId) -> Attempt {
        let (kind, protocol, consistency, owner) = match self.mutexes.get(mid) {
            Some(mx) => (mx.kind, mx.protocol, mx.consistency, mx.owner),
            None => return Attempt::Fail(Errno::InvalidArgument),
        };
        if consistency == Consistency::NotRecoverable {
            return Attempt::Fail(Errno::Unrecoverable);
        }
        if let Protocol::Protect { ceiling } = protocol {
            let base = self
                .threads
                .get(tid)
                .map(|t| t.base_priority)
                .unwrap_or(priority::IDLE);
            if base > ceiling {
                return Attempt::Fail(Errno::InvalidArgument);
            }
        }
        match owner {
            None => {
                self.grant_mutex(mid, tid);
                if matches!(protocol, Protocol::Protect { .. }) {
                    self.refresh_priority(tid);
                }
                if consistency == Consistency::Inconsistent {
                    Attempt::Acquired(Err(Errno::OwnerDied))
                } else {
                    Attempt::Acquired(Ok(()))
                }
            }
            Some(holder) if holder == tid => match kind {
                MutexKind::Recursive => {
                    let mx = self.mutexes.get_mut(mid).expect("checked above");
                    if mx.depth == u32::MAX {
                        return Attempt::Fail(Errno::Overflow);
                    }
                    mx.depth += 1;
                    Attempt::Acquired(Ok(()))
                }
                MutexKind::ErrorCheck => Attempt::Fail(Errno::Deadlock),
                MutexKind::Normal => {
                    let name = self.mutexes.get(mid).expect("checked above").name.clone();
                    match contract::violation::<()>(&name, "mutex_lock", Errno::Deadlock) {
                        Err(e) => Attempt::Fail(e),
                        Ok(()) => unreachable!(),
                    }
                }
            },
            Some(_) => Attempt::MustBlock,
        }
    }

    /// Release `mid` on behalf of `tid` and grant it to the best waiter.
    /// Callers have verified ownership.
    fn mutex_release(&mut self, mid: MutexId, tid: ThreadId) {
        let inconsistent = {
            let mx = self.mutexes.get_mut(mid).expect("release of dead mutex");
            mx.owner = None;
            mx.depth = 0;
            mx.consistency == Consistency::Inconsistent
        };
        if let Some(t) = self.threads.get_mut(tid) {
            t.held_mutexes.retain(|&m| m != mid);
        }

        if inconsistent {
            // Unlocked without acknowledgement: the protected state can no
            // longer be trusted by anyone.
            self.mutexes.get_mut(mid).expect("release of dead mutex").consistency =
                Consistency::NotRecoverable;
            let stranded: Vec<ThreadId> = self
                .mutexes
                .get(mid)
                .map(|mx| mx.waiters.iter_handles(&self.threads))
                .unwrap_or_default();
            for w in stranded {
                self.mutexes
                    .get_mut(mid)
                    .expect("release of dead mutex")
                    .waiters
                    .remove(&mut self.threads, w);
                self.ready_waiter(w, WakeReason::Error(Errno::Unrecoverable));
            }
            self.refresh_priority(tid);
            return;
        }

        // Grant before the releaser's boost lapses, so the hand-off reaches
        // the waiter in one scheduling step.
        let next = self
            .mutexes
            .get_mut(mid)
            .and_then(|mx| mx.waiters.pop_front(&mut self.threads));
        if let Some(w) = next {
            self.grant_mutex(mid, w);
            self.ready_waiter(w, WakeReason::Normal);
            // Ceiling boost for the new owner, or a remaining-waiter boost
            // under inheritance.
            self.refresh_priority(w);
        }
        self.refresh_priority(tid);
    }

    /// Release `mid` on behalf of `tid`, who is parking on a condvar.
    /// Ownership and depth were verified by the caller.
    pub(crate) fn mutex_release_for(&mut self, mid: MutexId, tid: ThreadId) {
        self.mutex_release(mid, tid);
    }

    /// Re-acquire `mid` for a condvar waiter `tid` that is leaving the
    /// condvar's wait list. `reason` is the condvar outcome, delivered once
    /// the mutex is actually granted.
    pub(crate) fn relock_for(&mut self, mid: MutexId, tid: ThreadId, reason: WakeReason) {
        self.clock.sleepers.remove(&mut self.threads, tid);
        {
            let t = self.threads.get_mut(tid).expect("relock of dead thread");
            t.cv_mutex = None;
            t.deferred_reason = Some(reason);
        }
        let (consistency, owner, inherits) = match self.mutexes.get(mid) {
            Some(mx) => (mx.consistency, mx.owner, mx.inherits()),
            None => {
                // The mutex was deleted while the thread waited on the
                // condvar; the wait cannot complete normally.
                self.threads.get_mut(tid).expect("relock of dead thread").deferred_reason = None;
                self.make_ready(tid, WakeReason::Error(Errno::InvalidArgument));
                return;
            }
        };
        if consistency == Consistency::NotRecoverable {
            self.threads.get_mut(tid).expect("relock of dead thread").deferred_reason = None;
            self.make_ready(tid, WakeReason::Error(Errno::Unrecoverable));
            return;
        }
        match owner {
            None => {
                self.grant_mutex(mid, tid);
                if consistency == Consistency::Inconsistent {
                    self.threads
                        .get_mut(tid)
                        .expect("relock of dead thread")
                        .deferred_reason = Some(WakeReason::Error(Errno::OwnerDied));
                }
                self.make_ready(tid, WakeReason::Normal);
                self.refresh_priority(tid);
            }
            Some(holder) => {
                let eff = u64::from(
                    self.threads
                        .get(tid)
                        .expect("relock of dead thread")
                        .effective_priority,
                );
                self.threads.get_mut(tid).expect("relock of dead thread").wait_target =
                    WaitTarget::Mutex(mid);
                self.mutexes
                    .get_mut(mid)
                    .expect("checked above")
                    .waiters
                    .insert_descending(&mut self.threads, tid, eff);
                if inherits {
                    self.refresh_priority(holder);
                }
            }
        }
    }

    /// Terminal cleanup for a dying thread's held mutexes. Robust mutexes
    /// are handed over inconsistent; stalled ones stay locked forever.
    pub(crate) fn release_held_on_death(&mut self, tid: ThreadId) {
        let held: Vec<MutexId> = match self.threads.get_mut(tid) {
            Some(t) => t.held_mutexes.drain(..).collect(),
            None => return,
        };
        for mid in held {
            let robust = match self.mutexes.get(mid) {
                Some(mx) => mx.robustness == Robustness::Robust,
                None => continue,
            };
            if !robust {
                log::warn!("stalled mutex {:?} held by dying thread {:?}", mid, tid);
                continue;
            }
            let next = {
                let mx = self.mutexes.get_mut(mid).expect("checked above");
                mx.consistency = Consistency::Inconsistent;
                mx.owner = None;
                mx.depth = 0;
                mx.waiters.pop_front(&mut self.threads)
            };
            if let Some(w) = next {
                self.grant_mutex(mid, w);
                self.ready_waiter(w, WakeReason::Error(Errno::OwnerDied));
                self.refresh_priority(w);
            }
        }
    }
}

impl Kernel {
    /// Create a mutex. A ceiling outside the ordinary priority band is
    /// rejected.
    pub fn mutex_create(
        &self,
        name: &str,
        kind: MutexKind,
        protocol: Protocol,
        robustness: Robustness,
    ) -> Result<MutexId> {
        if let Protocol::Protect { ceiling } = protocol {
            if !(priority::LOWEST..=priority::HIGHEST).contains(&ceiling) {
                return Err(Errno::InvalidArgument);
            }
        }
        let name: Box<str> = if name.is_empty() {
            Box::from("-")
        } else {
            Box::from(name)
        };
        self.with_state(|st| {
            Ok(st.mutexes.insert(MutexRec {
                name,
                kind,
                protocol,
                robustness,
                consistency: Consistency::Consistent,
                owner: None,
                depth: 0,
                waiters: List::new(),
            }))
        })
    }

    fn mutex_lock_inner(&self, mid: MutexId, timeout: Option<Duration>) -> Outcome {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return Outcome::Done(contract::violation("isr", "mutex_lock", Errno::NotPermitted));
            }
            let tid = st.current;
            match st.mutex_acquire_attempt(mid, tid) {
                Attempt::Acquired(r) => Outcome::Done(r),
                Attempt::Fail(e) => Outcome::Done(Err(e)),
                Attempt::MustBlock => {
                    if let Err(e) = st.begin_wait() {
                        return Outcome::Done(Err(e));
                    }
                    let deadline = timeout.map(|d| st.clock.deadline_after(d));
                    let eff = u64::from(
                        st.threads.get(tid).expect("current thread dead").effective_priority,
                    );
                    let (owner, inherits) = {
                        let mx = st.mutexes.get_mut(mid).expect("checked above");
                        mx.waiters.insert_descending(&mut st.threads, tid, eff);
                        (mx.owner, mx.inherits())
                    };
                    st.park_no_dispatch(WaitTarget::Mutex(mid), deadline);
                    match owner {
                        Some(holder) if inherits => st.refresh_priority(holder),
                        _ => st.preempt_check(),
                    }
                    Outcome::Parked
                }
            }
        })
    }

    /// Acquire `mid`, parking until it is granted.
    ///
    /// A wake reason of `Error(OwnerDied)` still grants ownership: the
    /// caller holds an inconsistent robust mutex and must recover.
    pub fn mutex_lock(&self, mid: MutexId) -> Outcome {
        self.mutex_lock_inner(mid, None)
    }

    /// Acquire `mid` or park until the relative deadline expires.
    pub fn mutex_lock_timed(&self, mid: MutexId, timeout: Duration) -> Outcome {
        self.mutex_lock_inner(mid, Some(timeout))
    }

    /// Acquire `mid` without blocking; `Errno::Busy` when it is held.
    pub fn mutex_try_lock(&self, mid: MutexId) -> Result<()> {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return contract::violation("isr", "mutex_try_lock", Errno::NotPermitted);
            }
            let tid = st.current;
            match st.mutex_acquire_attempt(mid, tid) {
                Attempt::Acquired(r) => r,
                Attempt::Fail(e) => Err(e),
                Attempt::MustBlock => Err(Errno::Busy),
            }
        })
    }

    /// Release `mid`. Unwinding a recursive hold only releases at depth one.
    pub fn mutex_unlock(&self, mid: MutexId) -> Result<()> {
        self.with_state(|st| {
            let tid = st.current;
            let (owner, depth, name) = match st.mutexes.get(mid) {
                Some(mx) => (mx.owner, mx.depth, mx.name.clone()),
                None => return Err(Errno::InvalidArgument),
            };
            if owner != Some(tid) {
                return contract::violation(&name, "mutex_unlock", Errno::NotPermitted);
            }
            if depth > 1 {
                st.mutexes.get_mut(mid).expect("checked above").depth -= 1;
                return Ok(());
            }
            st.mutex_release(mid, tid);
            Ok(())
        })
    }

    /// Acknowledge recovery of a robust mutex acquired with
    /// `Errno::OwnerDied`. Only the current owner may acknowledge.
    pub fn mutex_mark_consistent(&self, mid: MutexId) -> Result<()> {
        self.with_state(|st| {
            let tid = st.current;
            let mx = match st.mutexes.get_mut(mid) {
                Some(mx) => mx,
                None => return Err(Errno::InvalidArgument),
            };
            if mx.owner != Some(tid) {
                let name = mx.name.clone();
                return contract::violation(&name, "mutex_mark_consistent", Errno::NotPermitted);
            }
            if mx.consistency != Consistency::Inconsistent {
                let name = mx.name.clone();
                return contract::violation(&name, "mutex_mark_consistent", Errno::InvalidState);
            }
            mx.consistency = Consistency::Consistent;
            Ok(())
        })
    }

    /// The thread currently holding `mid`, if any.
    pub fn mutex_owner(&self, mid: MutexId) -> Result<Option<ThreadId>> {
        self.with_state(|st| st.mutexes.get(mid).map(|mx| mx.owner).ok_or(Errno::InvalidArgument))
    }

    /// Destroy an unowned, uncontended mutex.
    pub fn mutex_delete(&self, mid: MutexId) -> Result<()> {
        self.with_state(|st| {
            let mx = match st.mutexes.get(mid) {
                Some(mx) => mx,
                None => return Err(Errno::InvalidArgument),
            };
            if mx.owner.is_some() || !mx.waiters.is_empty() {
                return Err(Errno::Busy);
            }
            st.mutexes.remove(mid);
            Ok(())
        })
    }

    pub fn mutex_name(&self, mid: MutexId) -> Result<String> {
        self.with_state(|st| {
            st.mutexes
                .get(mid)
                .map(|mx| String::from(&*mx.name))
                .ok_or(Errno::InvalidArgument)
        })
    }
}
