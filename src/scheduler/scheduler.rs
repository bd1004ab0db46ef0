//! Scheduler core
//!
//! Priority-preemptive selection over the ready queue, the park/wake
//! machinery every primitive builds on, and the thread lifecycle operations.
//! Selection rule: highest effective priority wins, FIFO within a band; any
//! wakeup that readies a strictly higher-priority thread preempts, except
//! inside an interrupt bracket, where the hand-off is deferred to bracket
//! exit.

use crate::contract;
use crate::error::{Errno, Outcome, Result};
use crate::kernel::Kernel;
use crate::kernel::KernelState;
use crate::scheduler::stack::{Context, DEFAULT_STACK_SIZE};
use crate::scheduler::state::{validate_transition, ThreadState};
use crate::scheduler::thread::{priority, Entry, Tcb, ThreadId, WaitTarget, WakeReason};
use crate::time::{Duration, Instant};

impl KernelState {
    /// Move `tid` between lifecycle states. A transition the contract checks
    /// did not rule out but the table rejects is kernel corruption.
    pub(crate) fn transition(&mut self, tid: ThreadId, to: ThreadState) {
        let tcb = self.threads.get_mut(tid).expect("transition on dead thread");
        let from = tcb.state;
        if !validate_transition(from, to) {
            panic!("kernel corruption: thread '{}' {} -> {}", tcb.name, from, to);
        }
        tcb.state = to;
        log::trace!("thread {:?} {} -> {}", tid, from, to);
    }

    /// Link `tid` into the ready queue at its effective priority.
    pub(crate) fn enqueue_ready(&mut self, tid: ThreadId) {
        let prio = self
            .threads
            .get(tid)
            .expect("enqueue of dead thread")
            .effective_priority;
        self.ready.insert_descending(&mut self.threads, tid, u64::from(prio));
    }

    /// Hand the CPU to the highest-priority ready thread. The caller has
    /// already put the outgoing thread where its state says it belongs.
    fn dispatch_next(&mut self) {
        let next = self
            .ready
            .pop_front(&mut self.threads)
            .expect("ready queue empty: idle thread lost");
        self.transition(next, ThreadState::Running);
        let prev = self.current;
        self.current = next;
        if prev != next {
            self.stats.context_switches += 1;
            if let (Some(old), Some(new)) = self.threads.get2_mut(prev, next) {
                Context::switch(&mut old.context, &mut new.context);
            }
            log::trace!("switch {:?} -> {:?}", prev, next);
        }
    }

    /// Hand off if the scheduling decision changed: the current thread is no
    /// longer runnable, or the ready head outranks it. Inside an interrupt
    /// bracket the hand-off is recorded and performed at bracket exit.
    pub(crate) fn preempt_check(&mut self) {
        if self.isr_depth > 0 {
            self.switch_pending = true;
            return;
        }
        let running = self
            .threads
            .get(self.current)
            .map(|t| t.state == ThreadState::Running)
            .unwrap_or(false);
        if !running {
            self.dispatch_next();
            return;
        }
        if let Some(head) = self.ready.front_key(&self.threads) {
            let cur = u64::from(
                self.threads
                    .get(self.current)
                    .expect("current thread dead")
                    .effective_priority,
            );
            if head > cur {
                self.stats.preemptions += 1;
                self.transition(self.current, ThreadState::Ready);
                self.enqueue_ready(self.current);
                self.dispatch_next();
            }
        }
    }

    /// Gate every blocking call: rejects waits from interrupt context, the
    /// idle thread and the timer dispatch context, and consumes a pending
    /// interrupt request.
    pub(crate) fn begin_wait(&mut self) -> Result<()> {
        if self.isr_depth > 0 {
            return contract::violation("isr", "blocking call", Errno::NotPermitted);
        }
        let tid = self.current;
        if tid == self.idle || tid == self.timer_thread {
            let name = self
                .threads
                .get(tid)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| "?".into());
            return contract::violation(&name, "blocking call", Errno::NotPermitted);
        }
        let tcb = self.threads.get_mut(tid).expect("current thread dead");
        if tcb.interrupt_pending {
            tcb.interrupt_pending = false;
            return Err(Errno::Interrupted);
        }
        Ok(())
    }

    /// Park the current thread without dispatching. The caller has already
    /// linked it into the primitive's wait list where applicable.
    pub(crate) fn park_no_dispatch(&mut self, target: WaitTarget, deadline: Option<Instant>) {
        let tid = self.current;
        {
            let tcb = self.threads.get_mut(tid).expect("current thread dead");
            tcb.wait_target = target;
            tcb.wake_reason = WakeReason::None;
        }
        self.transition(tid, ThreadState::Waiting);
        if let Some(at) = deadline {
            self.clock
                .sleepers
                .insert_ascending(&mut self.threads, tid, at.as_ticks());
        }
    }

    /// Park the current thread and switch away.
    pub(crate) fn park_current(&mut self, target: WaitTarget, deadline: Option<Instant>) {
        self.park_no_dispatch(target, deadline);
        self.preempt_check();
    }

    /// Wake bookkeeping without the preemption check, for walk-and-wake
    /// loops that decide once at the end. The reason recorded earlier by a
    /// condvar hand-off takes precedence over `reason`.
    pub(crate) fn ready_waiter(&mut self, tid: ThreadId, reason: WakeReason) {
        self.clock.sleepers.remove(&mut self.threads, tid);
        let tcb = self.threads.get_mut(tid).expect("wake of dead thread");
        let reason = tcb.deferred_reason.take().unwrap_or(reason);
        tcb.wake_reason = reason;
        tcb.wait_target = WaitTarget::None;
        tcb.pending_flags = None;
        tcb.cv_mutex = None;
        self.transition(tid, ThreadState::Ready);
        self.enqueue_ready(tid);
    }

    /// Wake `tid` with `reason` and preempt if it now outranks the current
    /// thread.
    pub(crate) fn make_ready(&mut self, tid: ThreadId, reason: WakeReason) {
        self.ready_waiter(tid, reason);
        self.preempt_check();
    }

    /// Unlink a waiting thread from whatever it waits on, with the
    /// per-primitive bookkeeping that entails. Returns the wait target it was
    /// parked on. The caller decides what happens next (wake, relock, or
    /// termination).
    pub(crate) fn detach_waiter(&mut self, tid: ThreadId) -> WaitTarget {
        let target = self
            .threads
            .get(tid)
            .map(|t| t.wait_target)
            .unwrap_or_default();
        match target {
            WaitTarget::None | WaitTarget::Sleep | WaitTarget::SigFlags | WaitTarget::TimerQueue => {}
            WaitTarget::Mutex(m) => {
                if let Some(mx) = self.mutexes.get_mut(m) {
                    mx.waiters.remove(&mut self.threads, tid);
                }
                // The head waiter changed, so any inherited boost may drop.
                if let Some(owner) = self.mutexes.get(m).and_then(|mx| mx.owner) {
                    self.refresh_priority(owner);
                }
            }
            WaitTarget::Semaphore(s) => {
                if let Some(sem) = self.semaphores.get_mut(s) {
                    sem.waiters.remove(&mut self.threads, tid);
                }
            }
            WaitTarget::Condvar(c) => {
                if let Some(cv) = self.condvars.get_mut(c) {
                    cv.waiters.remove(&mut self.threads, tid);
                }
            }
            WaitTarget::Flags(f) => {
                if let Some(group) = self.flag_groups.get_mut(f) {
                    group.waiters.remove(&mut self.threads, tid);
                }
            }
            WaitTarget::QueueSend(q) => {
                if let Some(queue) = self.queues.get_mut(q) {
                    queue.senders.remove(&mut self.threads, tid);
                }
                // The payload the sender carried is dropped with the wait.
                if let Some(t) = self.threads.get_mut(tid) {
                    t.outbox = None;
                }
            }
            WaitTarget::QueueRecv(q) => {
                if let Some(queue) = self.queues.get_mut(q) {
                    queue.receivers.remove(&mut self.threads, tid);
                }
            }
            WaitTarget::Join(target) => {
                if let Some(t) = self.threads.get_mut(target) {
                    t.joiner = None;
                }
            }
        }
        target
    }

    /// Cancel `tid`'s wait with `reason` (deadline expiry or an explicit
    /// interrupt). A condvar waiter does not wake here: it moves on to
    /// re-acquire its mutex carrying `reason` for delivery at re-acquisition.
    pub(crate) fn cancel_wait(&mut self, tid: ThreadId, reason: WakeReason) {
        match self.detach_waiter(tid) {
            WaitTarget::TimerQueue => {}
            WaitTarget::Condvar(_) => {
                let mid = self
                    .threads
                    .get(tid)
                    .and_then(|t| t.cv_mutex)
                    .expect("condvar waiter without a mutex");
                self.clock.sleepers.remove(&mut self.threads, tid);
                self.relock_for(mid, tid, reason);
            }
            _ => self.make_ready(tid, reason),
        }
    }

    /// One clock tick: advance, wake expired timed waits, expire timers and
    /// ready the timer-service thread when firings are queued.
    pub(crate) fn tick(&mut self) {
        let now = self.clock.step();
        self.stats.ticks += 1;
        loop {
            match self.clock.sleepers.front_key(&self.threads) {
                Some(key) if key <= now.as_ticks() => {
                    let tid = self
                        .clock
                        .sleepers
                        .pop_front(&mut self.threads)
                        .expect("non-empty sleeper list");
                    self.cancel_wait(tid, WakeReason::Timeout);
                }
                _ => break,
            }
        }
        self.expire_timers(now);
        if !self.timer_pending.is_empty() {
            let ts = self.timer_thread;
            let parked = self
                .threads
                .get(ts)
                .map(|t| t.state == ThreadState::Waiting)
                .unwrap_or(false);
            if parked {
                self.make_ready(ts, WakeReason::Normal);
            }
        }
    }

    /// Park the timer-service thread back on its firing queue once the queue
    /// drains.
    pub(crate) fn park_timer_service(&mut self) {
        debug_assert_eq!(self.current, self.timer_thread);
        self.park_current(WaitTarget::TimerQueue, None);
    }

    /// Base priority plus the strongest boost from held mutexes: a protect
    /// ceiling, or the effective priority of an inheritance mutex's head
    /// waiter.
    pub(crate) fn computed_priority(&self, tid: ThreadId) -> u8 {
        let tcb = match self.threads.get(tid) {
            Some(t) => t,
            None => return priority::IDLE,
        };
        let mut prio = tcb.base_priority;
        for &mid in &tcb.held_mutexes {
            if let Some(mx) = self.mutexes.get(mid) {
                prio = prio.max(mx.boost_for(&self.threads));
            }
        }
        prio
    }

    /// Write a new effective priority and fix every structure ordered by it.
    fn apply_priority(&mut self, tid: ThreadId, new: u8) {
        let (state, target) = match self.threads.get_mut(tid) {
            Some(t) => {
                if t.effective_priority == new {
                    return;
                }
                t.effective_priority = new;
                (t.state, t.wait_target)
            }
            None => return,
        };
        let key = u64::from(new);
        match state {
            ThreadState::Ready => {
                self.ready.remove(&mut self.threads, tid);
                self.ready.insert_descending(&mut self.threads, tid, key);
            }
            ThreadState::Waiting => match target {
                WaitTarget::Mutex(m) => {
                    if let Some(mx) = self.mutexes.get_mut(m) {
                        if mx.waiters.remove(&mut self.threads, tid) {
                            mx.waiters.insert_descending(&mut self.threads, tid, key);
                        }
                    }
                }
                WaitTarget::Semaphore(s) => {
                    if let Some(sem) = self.semaphores.get_mut(s) {
                        if sem.waiters.remove(&mut self.threads, tid) {
                            sem.waiters.insert_descending(&mut self.threads, tid, key);
                        }
                    }
                }
                WaitTarget::Condvar(c) => {
                    if let Some(cv) = self.condvars.get_mut(c) {
                        if cv.waiters.remove(&mut self.threads, tid) {
                            cv.waiters.insert_descending(&mut self.threads, tid, key);
                        }
                    }
                }
                WaitTarget::Flags(f) => {
                    if let Some(group) = self.flag_groups.get_mut(f) {
                        if group.waiters.remove(&mut self.threads, tid) {
                            group.waiters.insert_descending(&mut self.threads, tid, key);
                        }
                    }
                }
                WaitTarget::QueueSend(q) => {
                    if let Some(queue) = self.queues.get_mut(q) {
                        if queue.senders.remove(&mut self.threads, tid) {
                            queue.senders.insert_descending(&mut self.threads, tid, key);
                        }
                    }
                }
                WaitTarget::QueueRecv(q) => {
                    if let Some(queue) = self.queues.get_mut(q) {
                        if queue.receivers.remove(&mut self.threads, tid) {
                            queue.receivers.insert_descending(&mut self.threads, tid, key);
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// Recompute `tid`'s effective priority and walk the inheritance chain:
    /// if `tid` is blocked on an inheritance mutex, its new priority may
    /// raise the owner, whose priority may raise the next owner, and so on.
    pub(crate) fn refresh_priority(&mut self, tid: ThreadId) {
        let mut cur = tid;
        // Bounded walk; a cycle here is an application deadlock, not a
        // kernel error, and must not hang the kernel.
        for _ in 0..64 {
            let eff = self.computed_priority(cur);
            let changed = self
                .threads
                .get(cur)
                .map(|t| t.effective_priority != eff)
                .unwrap_or(false);
            if changed {
                self.apply_priority(cur, eff);
            }
            let next = match self.threads.get(cur).map(|t| t.wait_target) {
                Some(WaitTarget::Mutex(m)) => self
                    .mutexes
                    .get(m)
                    .filter(|mx| mx.inherits())
                    .and_then(|mx| mx.owner),
                _ => None,
            };
            match next {
                Some(owner) if owner != cur => cur = owner,
                _ => break,
            }
        }
        self.preempt_check();
    }

    /// Tear a thread down: unlink it from every kernel structure, hand its
    /// robust mutexes over, record the exit code and wake the joiner.
    pub(crate) fn terminate_thread(&mut self, tid: ThreadId, code: i32) {
        let state = self.threads.get(tid).expect("terminating dead thread").state;
        match state {
            ThreadState::Ready => {
                self.ready.remove(&mut self.threads, tid);
            }
            ThreadState::Waiting => {
                self.detach_waiter(tid);
                self.clock.sleepers.remove(&mut self.threads, tid);
            }
            _ => {}
        }
        self.release_held_on_death(tid);
        {
            let tcb = self.threads.get_mut(tid).expect("terminating dead thread");
            tcb.exit_code = code;
        }
        self.transition(tid, ThreadState::Terminated);
        let joiner = self.threads.get_mut(tid).and_then(|t| t.joiner.take());
        log::debug!("thread {:?} terminated with code {}", tid, code);
        if let Some(j) = joiner {
            self.ready_waiter(j, WakeReason::Normal);
        }
        self.preempt_check();
    }
}

impl Kernel {
    /// Create a thread in the Inactive state. `priority` must lie in the
    /// ordinary band; `stack_size` is clamped up to the port minimum.
    pub fn thread_create(
        &self,
        name: &str,
        priority: u8,
        stack_size: usize,
        entry: Entry,
        arg: usize,
    ) -> Result<ThreadId> {
        if !(priority::LOWEST..=priority::HIGHEST).contains(&priority) {
            return Err(Errno::InvalidArgument);
        }
        self.with_state(|st| {
            let tid = st
                .threads
                .insert(Tcb::new(name, priority, stack_size, entry, arg));
            st.stats.threads_created += 1;
            log::debug!("thread {:?} '{}' created at priority {}", tid, name, priority);
            Ok(tid)
        })
    }

    /// Hand an Inactive thread to the scheduler. Preempts immediately when
    /// it outranks the caller.
    pub fn thread_start(&self, tid: ThreadId) -> Result<()> {
        self.with_state(|st| {
            let tcb = match st.threads.get(tid) {
                Some(t) => t,
                None => return Err(Errno::InvalidArgument),
            };
            if tcb.state != ThreadState::Inactive {
                let name = tcb.name.clone();
                return contract::violation(&name, "thread_start", Errno::InvalidState);
            }
            st.transition(tid, ThreadState::Ready);
            st.enqueue_ready(tid);
            st.preempt_check();
            Ok(())
        })
    }

    /// Create and start in one call, with the default stack size.
    pub fn spawn(&self, name: &str, priority: u8, entry: Entry, arg: usize) -> Result<ThreadId> {
        let tid = self.thread_create(name, priority, DEFAULT_STACK_SIZE, entry, arg)?;
        self.thread_start(tid)?;
        Ok(tid)
    }

    /// Create and start the designated initial thread after bring-up.
    pub fn spawn_main(&self, entry: Entry, arg: usize) -> Result<ThreadId> {
        self.spawn("main", priority::NORMAL, entry, arg)
    }

    /// Terminate the current thread with `code`. Not permitted for the idle
    /// thread, the timer-service thread or interrupt context.
    pub fn thread_exit(&self, code: i32) -> Result<()> {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return contract::violation("isr", "thread_exit", Errno::NotPermitted);
            }
            let tid = st.current;
            if tid == st.idle || tid == st.timer_thread {
                return contract::violation("service thread", "thread_exit", Errno::NotPermitted);
            }
            st.terminate_thread(tid, code);
            Ok(())
        })
    }

    /// Forcibly terminate `tid` with exit code `-1`. Killing the current
    /// thread is an exit; killing a service thread is not permitted.
    pub fn thread_kill(&self, tid: ThreadId) -> Result<()> {
        self.with_state(|st| {
            if tid == st.idle || tid == st.timer_thread {
                return contract::violation("service thread", "thread_kill", Errno::NotPermitted);
            }
            let state = match st.threads.get(tid) {
                Some(t) => t.state,
                None => return Err(Errno::InvalidArgument),
            };
            if state.is_terminal() {
                return Err(Errno::InvalidState);
            }
            st.terminate_thread(tid, -1);
            Ok(())
        })
    }

    /// Wait for `tid` to terminate, then reap it and return its exit code.
    ///
    /// Completes at once when the target has already terminated. Otherwise
    /// the caller parks; once woken it calls `thread_join` again, which then
    /// reaps. At most one thread may wait on a given target; a second joiner
    /// gets `Errno::Busy`.
    pub fn thread_join(&self, tid: ThreadId) -> Outcome<i32> {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return Outcome::Done(contract::violation(
                    "isr",
                    "thread_join",
                    Errno::NotPermitted,
                ));
            }
            let state = match st.threads.get(tid) {
                Some(t) => t.state,
                None => return Outcome::Done(Err(Errno::InvalidArgument)),
            };
            if tid == st.current {
                return Outcome::Done(Err(Errno::Deadlock));
            }
            if state == ThreadState::Terminated {
                return Outcome::Done(st.reap(tid));
            }
            if let Err(e) = st.begin_wait() {
                return Outcome::Done(Err(e));
            }
            let me = st.current;
            {
                let target = st.threads.get_mut(tid).expect("checked above");
                if target.joiner.is_some() {
                    return Outcome::Done(Err(Errno::Busy));
                }
                target.joiner = Some(me);
            }
            st.park_current(WaitTarget::Join(tid), None);
            Outcome::Parked
        })
    }

    /// Reap a terminated thread: reclaim its stack and slot, return its exit
    /// code. Only `Terminated` threads can be reaped.
    pub fn thread_reap(&self, tid: ThreadId) -> Result<i32> {
        self.with_state(|st| st.reap(tid))
    }

    /// Cancel `tid`'s wait with [`WakeReason::Interrupted`]. A thread that is
    /// not waiting gets a pending interrupt, consumed by its next blocking
    /// call.
    pub fn thread_interrupt(&self, tid: ThreadId) -> Result<()> {
        self.with_state(|st| {
            let (state, target, relocking) = match st.threads.get(tid) {
                Some(t) => (t.state, t.wait_target, t.deferred_reason.is_some()),
                None => return Err(Errno::InvalidArgument),
            };
            if state.is_terminal() {
                return Err(Errno::InvalidState);
            }
            // A condvar waiter re-acquiring its mutex resumes holding it;
            // that leg cannot be cancelled, so the interrupt is pended.
            if state == ThreadState::Waiting && target != WaitTarget::TimerQueue && !relocking {
                st.cancel_wait(tid, WakeReason::Interrupted);
            } else {
                st.threads
                    .get_mut(tid)
                    .expect("checked above")
                    .interrupt_pending = true;
            }
            Ok(())
        })
    }

    /// Change `tid`'s base priority. The effective priority follows unless a
    /// boost from a held mutex still dominates.
    pub fn thread_set_priority(&self, tid: ThreadId, priority: u8) -> Result<()> {
        if !(priority::LOWEST..=priority::HIGHEST).contains(&priority) {
            return Err(Errno::InvalidArgument);
        }
        self.with_state(|st| {
            match st.threads.get_mut(tid) {
                Some(t) if !t.state.is_terminal() => t.base_priority = priority,
                Some(_) => return Err(Errno::InvalidState),
                None => return Err(Errno::InvalidArgument),
            }
            st.refresh_priority(tid);
            Ok(())
        })
    }

    /// Base priority of `tid`.
    pub fn thread_priority(&self, tid: ThreadId) -> Result<u8> {
        self.with_state(|st| {
            st.threads
                .get(tid)
                .map(|t| t.base_priority)
                .ok_or(Errno::InvalidArgument)
        })
    }

    /// Effective priority, including any inheritance or ceiling boost.
    pub fn thread_effective_priority(&self, tid: ThreadId) -> Result<u8> {
        self.with_state(|st| {
            st.threads
                .get(tid)
                .map(|t| t.effective_priority)
                .ok_or(Errno::InvalidArgument)
        })
    }

    /// Give up the CPU to the next thread of equal priority; a no-op when
    /// the current thread is alone in its band. Permitted but inert in
    /// interrupt context.
    pub fn yield_now(&self) {
        self.with_state(|st| {
            if st.isr_depth > 0 {
                return;
            }
            let tid = st.current;
            st.transition(tid, ThreadState::Ready);
            st.enqueue_ready(tid);
            st.dispatch_next();
        });
    }

    /// Park the current thread until the deadline passes. Wakes with
    /// [`WakeReason::Timeout`] on completion.
    pub fn sleep_until(&self, deadline: Instant) -> Outcome {
        self.with_state(|st| {
            if let Err(e) = st.begin_wait() {
                return Outcome::Done(Err(e));
            }
            if deadline <= st.clock.now() {
                return Outcome::Done(Ok(()));
            }
            st.park_current(WaitTarget::Sleep, Some(deadline));
            Outcome::Parked
        })
    }

    /// Park the current thread for `d` ticks. A zero duration yields
    /// instead.
    pub fn sleep_for(&self, d: Duration) -> Outcome {
        if d == Duration::ZERO {
            self.yield_now();
            return Outcome::Done(Ok(()));
        }
        let deadline = self.with_state(|st| st.clock.deadline_after(d));
        self.sleep_until(deadline)
    }
}

impl KernelState {
    fn reap(&mut self, tid: ThreadId) -> Result<i32> {
        let tcb = match self.threads.get(tid) {
            Some(t) => t,
            None => return Err(Errno::InvalidArgument),
        };
        if tcb.state != ThreadState::Terminated {
            return Err(Errno::InvalidState);
        }
        let code = tcb.exit_code;
        self.transition(tid, ThreadState::Destroyed);
        self.threads.remove(tid);
        Ok(code)
    }
}
