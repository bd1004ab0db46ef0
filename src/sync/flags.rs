//! Event flags
//!
//! A 32-bit flag word with per-waiter wake predicates: each waiter records a
//! mask and a mode (any bit / all bits, optionally consuming the matched
//! bits). Setting flags walks the waiters in priority order and evaluates
//! every predicate against the live word, so a CLEAR waiter consumes its
//! bits atomically with its wake and later waiters see the consumed word.
//!
//! `flags_set` is callable from interrupt context; it is the canonical way
//! for an ISR to release a thread.
//!
//! The same mask/mode machinery backs the per-thread signal flags
//! (`thread_sig_*`), a directed wakeup channel that needs no shared object.

use crate::contract;
use crate::error::{Errno, Outcome, Result};
use crate::kernel::{Kernel, KernelState};
use crate::scheduler::state::ThreadState;
use crate::scheduler::thread::{QueueLink, Tcb, ThreadId, WaitTarget, WakeReason};
use crate::time::Duration;
use crate::utils::{Handle, List};
use alloc::boxed::Box;
use alloc::string::String;
use bitflags::bitflags;

bitflags! {
    /// Flag-wait mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagsMode: u8 {
        /// Wait until every bit of the mask is set; the default is any bit.
        const ALL = 0b01;
        /// Consume the matched bits atomically with the wake.
        const CLEAR = 0b10;
    }
}

/// Evaluate a flag-wait predicate. Returns the matched bits on success.
pub(crate) fn flags_match(word: u32, mask: u32, mode: FlagsMode) -> Option<u32> {
    let hit = word & mask;
    if mode.contains(FlagsMode::ALL) {
        (hit == mask).then_some(mask)
    } else if hit != 0 {
        Some(hit)
    } else {
        None
    }
}

/// Handle to an event-flags group.
pub type FlagsId = Handle<FlagsRec>;

/// Event-flags group record.
pub struct FlagsRec {
    pub(crate) name: Box<str>,
    pub(crate) word: u32,
    pub(crate) waiters: List<Tcb, QueueLink>,
}

impl KernelState {
    /// OR `bits` into the group's word and wake every waiter whose predicate
    /// now holds, in priority order, consuming bits for CLEAR waiters as the
    /// walk goes.
    fn flags_set_impl(&mut self, fid: FlagsId, bits: u32) -> Result<()> {
        {
            let group = match self.flag_groups.get_mut(fid) {
                Some(g) => g,
                None => return Err(Errno::InvalidArgument),
            };
            group.word |= bits;
        }
        let candidates = self
            .flag_groups
            .get(fid)
            .map(|g| g.waiters.iter_handles(&self.threads))
            .unwrap_or_default();
        let mut woke = false;
        for w in candidates {
            let (mask, mode) = match self.threads.get(w).and_then(|t| t.pending_flags) {
                Some(p) => p,
                None => continue,
            };
            let word = self.flag_groups.get(fid).expect("checked above").word;
            let hit = match flags_match(word, mask, mode) {
                Some(hit) => hit,
                None => continue,
            };
            if mode.contains(FlagsMode::CLEAR) {
                self.flag_groups.get_mut(fid).expect("checked above").word &= !hit;
            }
            self.flag_groups
                .get_mut(fid)
                .expect("checked above")
                .waiters
                .remove(&mut self.threads, w);
            self.threads.get_mut(w).expect("waiter vanished").won_flags = hit;
            self.ready_waiter(w, WakeReason::Normal);
            woke = true;
        }
        if woke {
            self.preempt_check();
        }
        Ok(())
    }

    /// Raise signal bits on `tid`, waking it when its pending predicate now
    /// holds.
    fn sig_raise_impl(&mut self, tid: ThreadId, bits: u32) -> Result<()> {
        let (state, target, pending) = match self.threads.get_mut(tid) {
            Some(t) => {
                t.sig_flags |= bits;
                (t.state, t.wait_target, t.pending_flags)
            }
            None => return Err(Errno::InvalidArgument),
        };
        if state != ThreadState::Waiting || target != WaitTarget::SigFlags {
            return Ok(());
        }
        let (mask, mode) = pending.expect("sig waiter without a predicate");
        let word = self.threads.get(tid).expect("checked above").sig_flags;
        if let Some(hit) = flags_match(word, mask, mode) {
            {
                let t = self.threads.get_mut(tid).expect("checked above");
                if mode.contains(FlagsMode::CLEAR) {
                    t.sig_flags &= !hit;
                }
                t.won_flags = hit;
            }
            self.make_ready(tid, WakeReason::Normal);
        }
        Ok(())
    }
}

impl Kernel {
    /// Create an event-flags group with an initial word.
    pub fn flags_create(&self, name: &str, initial: u32) -> FlagsId {
        let name: Box<str> = if name.is_empty() {
            Box::from("-")
        } else {
            Box::from(name)
        };
        self.with_state(|st| {
            st.flag_groups.insert(FlagsRec {
                name,
                word: initial,
                waiters: List::new(),
            })
        })
    }

    /// Set `bits` and wake the waiters they satisfy. Callable from
    /// interrupt context.
    pub fn flags_set(&self, fid: FlagsId, bits: u32) -> Result<()> {
        self.with_state(|st| st.flags_set_impl(fid, bits))
    }

    /// Clear `bits`; returns the word as it was before clearing.
    pub fn flags_clear(&self, fid: FlagsId, bits: u32) -> Result<u32> {
        self.with_state(|st| {
            let group = match st.flag_groups.get_mut(fid) {
                Some(g) => g,
                None => return Err(Errno::InvalidArgument),
            };
            let before = group.word;
            group.word &= !bits;
            Ok(before)
        })
    }

    /// Current flag word.
    pub fn flags_get(&self, fid: FlagsId) -> Result<u32> {
        self.with_state(|st| {
            st.flag_groups
                .get(fid)
                .map(|g| g.word)
                .ok_or(Errno::InvalidArgument)
        })
    }

    fn flags_wait_inner(
        &self,
        fid: FlagsId,
        mask: u32,
        mode: FlagsMode,
        timeout: Option<Duration>,
    ) -> Outcome<u32> {
        if mask == 0 {
            return Outcome::Done(Err(Errno::InvalidArgument));
        }
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return Outcome::Done(contract::violation(
                    "isr",
                    "flags_wait",
                    Errno::NotPermitted,
                ));
            }
            let word = match st.flag_groups.get(fid) {
                Some(g) => g.word,
                None => return Outcome::Done(Err(Errno::InvalidArgument)),
            };
            if let Some(hit) = flags_match(word, mask, mode) {
                if mode.contains(FlagsMode::CLEAR) {
                    st.flag_groups.get_mut(fid).expect("checked above").word &= !hit;
                }
                return Outcome::Done(Ok(hit));
            }
            if let Err(e) = st.begin_wait() {
                return Outcome::Done(Err(e));
            }
            let tid = st.current;
            let deadline = timeout.map(|d| st.clock.deadline_after(d));
            let eff = u64::from(
                st.threads.get(tid).expect("current thread dead").effective_priority,
            );
            st.threads.get_mut(tid).expect("current thread dead").pending_flags =
                Some((mask, mode));
            st.flag_groups
                .get_mut(fid)
                .expect("checked above")
                .waiters
                .insert_descending(&mut st.threads, tid, eff);
            st.park_current(WaitTarget::Flags(fid), deadline);
            Outcome::Parked
        })
    }

    /// Wait until the mask/mode predicate holds; returns the matched bits.
    /// After parking, the bits are read back with [`won_flags`].
    ///
    /// [`won_flags`]: Kernel::won_flags
    pub fn flags_wait(&self, fid: FlagsId, mask: u32, mode: FlagsMode) -> Outcome<u32> {
        self.flags_wait_inner(fid, mask, mode, None)
    }

    /// As [`flags_wait`], with a relative deadline.
    ///
    /// [`flags_wait`]: Kernel::flags_wait
    pub fn flags_wait_timed(
        &self,
        fid: FlagsId,
        mask: u32,
        mode: FlagsMode,
        timeout: Duration,
    ) -> Outcome<u32> {
        self.flags_wait_inner(fid, mask, mode, Some(timeout))
    }

    /// Evaluate the predicate without blocking; `Errno::Busy` when it does
    /// not hold.
    pub fn flags_try_wait(&self, fid: FlagsId, mask: u32, mode: FlagsMode) -> Result<u32> {
        if mask == 0 {
            return Err(Errno::InvalidArgument);
        }
        self.with_state(|st| {
            let word = match st.flag_groups.get(fid) {
                Some(g) => g.word,
                None => return Err(Errno::InvalidArgument),
            };
            match flags_match(word, mask, mode) {
                Some(hit) => {
                    if mode.contains(FlagsMode::CLEAR) {
                        st.flag_groups.get_mut(fid).expect("checked above").word &= !hit;
                    }
                    Ok(hit)
                }
                None => Err(Errno::Busy),
            }
        })
    }

    /// Destroy an uncontended flags group.
    pub fn flags_delete(&self, fid: FlagsId) -> Result<()> {
        self.with_state(|st| {
            let group = match st.flag_groups.get(fid) {
                Some(g) => g,
                None => return Err(Errno::InvalidArgument),
            };
            if !group.waiters.is_empty() {
                return Err(Errno::Busy);
            }
            st.flag_groups.remove(fid);
            Ok(())
        })
    }

    pub fn flags_name(&self, fid: FlagsId) -> Result<String> {
        self.with_state(|st| {
            st.flag_groups
                .get(fid)
                .map(|g| String::from(&*g.name))
                .ok_or(Errno::InvalidArgument)
        })
    }

    /// Bits that satisfied `tid`'s last completed flag or signal wait.
    pub fn won_flags(&self, tid: ThreadId) -> Result<u32> {
        self.with_state(|st| {
            st.threads
                .get(tid)
                .map(|t| t.won_flags)
                .ok_or(Errno::InvalidArgument)
        })
    }

    /// Raise signal bits on `tid`. Callable from interrupt context.
    pub fn thread_sig_raise(&self, tid: ThreadId, bits: u32) -> Result<()> {
        self.with_state(|st| st.sig_raise_impl(tid, bits))
    }

    fn sig_wait_inner(&self, mask: u32, mode: FlagsMode, timeout: Option<Duration>) -> Outcome<u32> {
        if mask == 0 {
            return Outcome::Done(Err(Errno::InvalidArgument));
        }
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return Outcome::Done(contract::violation(
                    "isr",
                    "thread_sig_wait",
                    Errno::NotPermitted,
                ));
            }
            let tid = st.current;
            let word = match st.threads.get(tid) {
                Some(t) => t.sig_flags,
                None => return Outcome::Done(Err(Errno::InvalidArgument)),
            };
            if let Some(hit) = flags_match(word, mask, mode) {
                let t = st.threads.get_mut(tid).expect("checked above");
                if mode.contains(FlagsMode::CLEAR) {
                    t.sig_flags &= !hit;
                }
                return Outcome::Done(Ok(hit));
            }
            if let Err(e) = st.begin_wait() {
                return Outcome::Done(Err(e));
            }
            let deadline = timeout.map(|d| st.clock.deadline_after(d));
            st.threads.get_mut(tid).expect("current thread dead").pending_flags =
                Some((mask, mode));
            st.park_current(WaitTarget::SigFlags, deadline);
            Outcome::Parked
        })
    }

    /// Wait on the calling thread's own signal flags.
    pub fn thread_sig_wait(&self, mask: u32, mode: FlagsMode) -> Outcome<u32> {
        self.sig_wait_inner(mask, mode, None)
    }

    /// As [`thread_sig_wait`], with a relative deadline.
    ///
    /// [`thread_sig_wait`]: Kernel::thread_sig_wait
    pub fn thread_sig_wait_timed(
        &self,
        mask: u32,
        mode: FlagsMode,
        timeout: Duration,
    ) -> Outcome<u32> {
        self.sig_wait_inner(mask, mode, Some(timeout))
    }

    /// Evaluate the calling thread's signal predicate without blocking.
    pub fn thread_sig_try_wait(&self, mask: u32, mode: FlagsMode) -> Result<u32> {
        if mask == 0 {
            return Err(Errno::InvalidArgument);
        }
        self.with_state(|st| {
            let tid = st.current;
            let word = match st.threads.get(tid) {
                Some(t) => t.sig_flags,
                None => return Err(Errno::InvalidArgument),
            };
            match flags_match(word, mask, mode) {
                Some(hit) => {
                    let t = st.threads.get_mut(tid).expect("checked above");
                    if mode.contains(FlagsMode::CLEAR) {
                        t.sig_flags &= !hit;
                    }
                    Ok(hit)
                }
                None => Err(Errno::Busy),
            }
        })
    }

    /// The calling thread's pending signal bits.
    pub fn thread_sig_pending(&self) -> u32 {
        self.with_state(|st| {
            st.threads
                .get(st.current)
                .map(|t| t.sig_flags)
                .unwrap_or(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_partial() {
        assert_eq!(flags_match(0b0110, 0b0011, FlagsMode::empty()), Some(0b0010));
        assert_eq!(flags_match(0b1000, 0b0011, FlagsMode::empty()), None);
    }

    #[test]
    fn all_requires_full_mask() {
        assert_eq!(flags_match(0b0110, 0b0110, FlagsMode::ALL), Some(0b0110));
        assert_eq!(flags_match(0b0100, 0b0110, FlagsMode::ALL), None);
    }

    #[test]
    fn clear_does_not_change_matching() {
        let m = FlagsMode::ALL | FlagsMode::CLEAR;
        assert_eq!(flags_match(0b1111, 0b0101, m), Some(0b0101));
    }
}
