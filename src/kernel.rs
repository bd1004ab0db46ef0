//! Kernel instance
//!
//! All kernel objects live inside one [`Kernel`] value: the thread arena, the
//! ready queue, the clock and every synchronization primitive. Instances are
//! fully isolated, so tests build as many independent kernels as they need.
//!
//! The kernel is driven from outside: a port (or a test harness) calls the
//! public operations on behalf of the logical current thread and advances
//! time with [`Kernel::tick`]. Every operation runs start to finish inside
//! one critical section; timer callbacks are the only user code the kernel
//! itself calls, and those run after the section ends, on the timer-service
//! thread.

use crate::error::{Errno, Result};
use crate::scheduler::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::scheduler::state::ThreadState;
use crate::scheduler::thread::{priority, Tcb, ThreadId, QueueLink, WaitTarget, WakeReason};
use crate::sync::condvar::CondvarRec;
use crate::sync::critical::CriticalCell;
use crate::sync::flags::FlagsRec;
use crate::sync::mqueue::QueueRec;
use crate::sync::mutex::MutexRec;
use crate::sync::semaphore::SemaphoreRec;
use crate::time::timer::{TimerCallback, TimerId, TimerRec};
use crate::time::{Clock, Instant};
use crate::utils::{Arena, List};
use alloc::collections::VecDeque;
use alloc::string::String;
use core::sync::atomic::{AtomicBool, Ordering};

/// Aggregate kernel counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelStats {
    /// Threads ever created
    pub threads_created: u64,
    /// Completed context hand-offs
    pub context_switches: u64,
    /// Hand-offs forced by a higher-priority thread becoming ready
    pub preemptions: u64,
    /// Clock ticks processed
    pub ticks: u64,
    /// Software timer expiries
    pub timer_firings: u64,
}

/// Everything behind the critical section. Scheduler and primitive internals
/// are `impl KernelState` blocks in their own modules; they compose on
/// `&mut self` and never re-enter the lock.
pub(crate) struct KernelState {
    pub(crate) threads: Arena<Tcb>,
    pub(crate) ready: List<Tcb, QueueLink>,
    pub(crate) current: ThreadId,
    pub(crate) idle: ThreadId,
    pub(crate) timer_thread: ThreadId,

    pub(crate) clock: Clock,
    pub(crate) timers: Arena<TimerRec>,
    /// Expired timers awaiting callback dispatch, oldest first
    pub(crate) timer_pending: VecDeque<TimerId>,

    pub(crate) mutexes: Arena<MutexRec>,
    pub(crate) semaphores: Arena<SemaphoreRec>,
    pub(crate) condvars: Arena<CondvarRec>,
    pub(crate) flag_groups: Arena<FlagsRec>,
    pub(crate) queues: Arena<QueueRec>,

    /// Interrupt nesting depth; non-zero defers hand-offs
    pub(crate) isr_depth: u32,
    /// A hand-off became due inside an interrupt and runs at final exit
    pub(crate) switch_pending: bool,

    pub(crate) stats: KernelStats,
}

impl KernelState {
    fn new() -> Self {
        let mut threads = Arena::new();
        let idle = threads.insert(Tcb::service("idle", priority::IDLE, MIN_STACK_SIZE));
        let timer_thread =
            threads.insert(Tcb::service("timers", priority::DEFERRED, DEFAULT_STACK_SIZE));

        // Boot shortcut: the idle thread is born running and the
        // timer-service thread parks on its firing queue.
        threads.get_mut(idle).expect("fresh slot").state = ThreadState::Running;
        {
            let t = threads.get_mut(timer_thread).expect("fresh slot");
            t.state = ThreadState::Waiting;
            t.wait_target = WaitTarget::TimerQueue;
        }

        Self {
            threads,
            ready: List::new(),
            current: idle,
            idle,
            timer_thread,
            clock: Clock::new(),
            timers: Arena::new(),
            timer_pending: VecDeque::new(),
            mutexes: Arena::new(),
            semaphores: Arena::new(),
            condvars: Arena::new(),
            flag_groups: Arena::new(),
            queues: Arena::new(),
            isr_depth: 0,
            switch_pending: false,
            stats: KernelStats::default(),
        }
    }
}

enum TimerStep {
    Run(TimerId, TimerCallback),
    Skip,
    Done,
}

/// An isolated kernel instance.
pub struct Kernel {
    state: CriticalCell<KernelState>,
    /// Guards against re-entering timer dispatch from a callback
    dispatching: AtomicBool,
}

impl Kernel {
    /// Bring up a kernel: an idle thread (running) and the timer-service
    /// thread (parked), nothing else.
    pub fn new() -> Self {
        Self {
            state: CriticalCell::new(KernelState::new()),
            dispatching: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        self.state.with(f)
    }

    /// Advance the clock by one tick: wake expired timed waits, expire
    /// timers, then run any due timer callbacks.
    pub fn tick(&self) {
        self.with_state(|st| st.tick());
        self.dispatch_timers();
    }

    /// Advance the clock by `n` ticks.
    pub fn advance(&self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Run `f` in interrupt context. Wakeups requested inside are recorded
    /// but the hand-off is deferred to the final bracket exit, so nested
    /// interrupts drain before any thread switch.
    pub fn interrupt<R>(&self, f: impl FnOnce(&Kernel) -> R) -> R {
        self.with_state(|st| st.isr_depth += 1);
        let out = f(self);
        self.with_state(|st| {
            st.isr_depth -= 1;
            if st.isr_depth == 0 && st.switch_pending {
                st.switch_pending = false;
                st.preempt_check();
            }
        });
        self.dispatch_timers();
        out
    }

    pub fn in_interrupt(&self) -> bool {
        self.with_state(|st| st.isr_depth > 0)
    }

    /// Run queued timer callbacks while the timer-service thread holds the
    /// CPU. Callbacks execute outside the critical section; each one may arm,
    /// stop or delete timers, including its own.
    fn dispatch_timers(&self) {
        if self.dispatching.swap(true, Ordering::Acquire) {
            return;
        }
        loop {
            let step = self.with_state(|st| {
                if st.current != st.timer_thread {
                    return TimerStep::Done;
                }
                match st.timer_pending.pop_front() {
                    None => {
                        st.park_timer_service();
                        TimerStep::Done
                    }
                    Some(id) => match st.timers.get_mut(id).and_then(|t| t.callback.take()) {
                        Some(cb) => TimerStep::Run(id, cb),
                        // Deleted between expiry and dispatch
                        None => TimerStep::Skip,
                    },
                }
            });
            match step {
                TimerStep::Run(id, mut cb) => {
                    cb(self);
                    self.with_state(|st| {
                        if let Some(t) = st.timers.get_mut(id) {
                            if t.callback.is_none() {
                                t.callback = Some(cb);
                            }
                        }
                    });
                }
                TimerStep::Skip => {}
                TimerStep::Done => break,
            }
        }
        self.dispatching.store(false, Ordering::Release);
    }

    /// Current tick count.
    pub fn now(&self) -> Instant {
        self.with_state(|st| st.clock.now())
    }

    /// Wall-clock seconds; metadata that never drives a wakeup.
    pub fn realtime(&self) -> u64 {
        self.with_state(|st| st.clock.realtime())
    }

    pub fn set_realtime(&self, now_secs: u64) {
        self.with_state(|st| st.clock.set_realtime(now_secs));
    }

    /// The logical running thread.
    pub fn current(&self) -> ThreadId {
        self.with_state(|st| st.current)
    }

    pub fn idle_thread(&self) -> ThreadId {
        self.with_state(|st| st.idle)
    }

    pub fn thread_state(&self, tid: ThreadId) -> Result<ThreadState> {
        self.with_state(|st| st.threads.get(tid).map(|t| t.state).ok_or(Errno::InvalidArgument))
    }

    /// Why `tid` last woke from a wait.
    pub fn wake_reason(&self, tid: ThreadId) -> Result<WakeReason> {
        self.with_state(|st| {
            st.threads
                .get(tid)
                .map(|t| t.wake_reason)
                .ok_or(Errno::InvalidArgument)
        })
    }

    pub fn thread_name(&self, tid: ThreadId) -> Result<String> {
        self.with_state(|st| {
            st.threads
                .get(tid)
                .map(|t| String::from(&*t.name))
                .ok_or(Errno::InvalidArgument)
        })
    }

    pub fn stats(&self) -> KernelStats {
        self.with_state(|st| st.stats)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
