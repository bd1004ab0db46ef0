//! Thread control block
//!
//! A thread owns its stack, saved context and identity, and carries the two
//! intrusive link nodes the kernel threads it through: one for the ready
//! queue or a single wait list (never both), one for the clock's deadline
//! list during timed waits.

use crate::error::Errno;
use crate::scheduler::stack::{Context, Stack};
use crate::scheduler::state::ThreadState;
use crate::sync::condvar::CondvarId;
use crate::sync::flags::{FlagsId, FlagsMode};
use crate::sync::mqueue::{Message, QueueId};
use crate::sync::mutex::MutexId;
use crate::sync::semaphore::SemaphoreId;
use crate::utils::{Adapter, Handle, Link};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Handle to a thread.
pub type ThreadId = Handle<Tcb>;

/// Thread entry function: receives the spawn argument, returns an exit code.
pub type Entry = fn(usize) -> i32;

/// Priority bands. Higher values are more urgent.
pub mod priority {
    /// Reserved for the idle thread; runs when nothing else is ready.
    pub const IDLE: u8 = 0;

    /// Lowest priority an ordinary thread may use.
    pub const LOWEST: u8 = 1;

    pub const LOW: u8 = 64;
    pub const NORMAL: u8 = 128;
    pub const HIGH: u8 = 192;

    /// Highest priority an ordinary thread may use.
    pub const HIGHEST: u8 = 239;

    /// Reserved for the timer-service thread that runs interrupt-deferred
    /// work; outranks every ordinary thread.
    pub const DEFERRED: u8 = 240;
}

static_assertions::const_assert!(priority::IDLE < priority::LOWEST);
static_assertions::const_assert!(priority::LOWEST <= priority::NORMAL);
static_assertions::const_assert!(priority::NORMAL <= priority::HIGHEST);
static_assertions::const_assert!(priority::HIGHEST < priority::DEFERRED);

/// Why a blocked thread was last woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeReason {
    /// Not woken since the last park
    #[default]
    None,

    /// The awaited resource or signal arrived
    Normal,

    /// The wait's absolute deadline expired (also reports sleep completion)
    Timeout,

    /// The wait was cancelled by an explicit interrupt request
    Interrupted,

    /// The wait ended with an error the waiter must handle, e.g.
    /// `Errno::OwnerDied` when a robust mutex is handed over
    Error(Errno),
}

/// Which structure a waiting thread is parked on. One closed dispatch point
/// for the timeout/cancellation paths, instead of virtual dispatch per
/// primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitTarget {
    #[default]
    None,
    Mutex(MutexId),
    Semaphore(SemaphoreId),
    Condvar(CondvarId),
    Flags(FlagsId),
    QueueSend(QueueId),
    QueueRecv(QueueId),
    Join(ThreadId),
    Sleep,
    /// Waiting on the thread's own signal-flag word
    SigFlags,
    /// The timer-service thread idling between firings
    TimerQueue,
}

/// Thread control block.
pub struct Tcb {
    /// Display name; `"-"` when unnamed. Metadata only.
    pub name: Box<str>,

    pub state: ThreadState,

    /// Priority assigned by the creator or `thread_set_priority`
    pub base_priority: u8,

    /// Base priority plus any inherited or protect ceilings currently applied
    pub effective_priority: u8,

    pub entry: Option<Entry>,
    pub arg: usize,
    pub exit_code: i32,

    pub stack: Stack,
    pub context: Context,

    /// Node for the ready queue or one wait list (exclusive)
    pub queue_link: Link<Tcb>,

    /// Node for the clock's deadline list (timed waits only)
    pub clock_link: Link<Tcb>,

    pub wait_target: WaitTarget,
    pub wake_reason: WakeReason,

    /// Set by `thread_interrupt` when the thread is not currently waiting;
    /// consumed by its next blocking call.
    pub interrupt_pending: bool,

    /// Signal-flag word for directed wakeup
    pub sig_flags: u32,

    /// Requested mask and mode while blocked on flags (event group or own
    /// signal flags)
    pub pending_flags: Option<(u32, FlagsMode)>,

    /// Bits that satisfied the last completed flag wait
    pub won_flags: u32,

    /// Message delivered by a queue (direct hand-off or wake-time dequeue)
    pub inbox: Option<Message>,

    /// Message carried while blocked on a full queue
    pub outbox: Option<Message>,

    /// Wake reason decided before a condvar waiter re-acquires its mutex;
    /// delivered when the re-acquisition completes.
    pub deferred_reason: Option<WakeReason>,

    /// Condvar waiters remember which mutex to re-acquire.
    pub cv_mutex: Option<MutexId>,

    /// Mutexes currently held, for priority recomputation and robust cleanup
    pub held_mutexes: Vec<MutexId>,

    /// At most one thread may wait to join this one.
    pub joiner: Option<ThreadId>,
}

impl Tcb {
    pub fn new(name: &str, priority: u8, stack_size: usize, entry: Entry, arg: usize) -> Self {
        let stack = Stack::new(stack_size);
        let context = Context::prepare(&stack, entry as usize);
        Self {
            name: normalize_name(name),
            state: ThreadState::Inactive,
            base_priority: priority,
            effective_priority: priority,
            entry: Some(entry),
            arg,
            exit_code: 0,
            stack,
            context,
            queue_link: Link::new(),
            clock_link: Link::new(),
            wait_target: WaitTarget::None,
            wake_reason: WakeReason::None,
            interrupt_pending: false,
            sig_flags: 0,
            pending_flags: None,
            won_flags: 0,
            inbox: None,
            outbox: None,
            deferred_reason: None,
            cv_mutex: None,
            held_mutexes: Vec::new(),
            joiner: None,
        }
    }

    /// Internal service thread without an entry function (idle, timers).
    pub(crate) fn service(name: &str, priority: u8, stack_size: usize) -> Self {
        fn never(_arg: usize) -> i32 {
            0
        }
        let mut tcb = Self::new(name, priority, stack_size, never, 0);
        tcb.entry = None;
        tcb
    }
}

fn normalize_name(name: &str) -> Box<str> {
    if name.is_empty() {
        Box::from("-")
    } else {
        Box::from(name)
    }
}

/// Ready-queue / wait-list adapter over `queue_link`.
pub struct QueueLink;

impl Adapter<Tcb> for QueueLink {
    fn link(item: &Tcb) -> &Link<Tcb> {
        &item.queue_link
    }
    fn link_mut(item: &mut Tcb) -> &mut Link<Tcb> {
        &mut item.queue_link
    }
}

/// Clock deadline-list adapter over `clock_link`.
pub struct ClockLink;

impl Adapter<Tcb> for ClockLink {
    fn link(item: &Tcb) -> &Link<Tcb> {
        &item.clock_link
    }
    fn link_mut(item: &mut Tcb) -> &mut Link<Tcb> {
        &mut item.clock_link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_threads_get_placeholder() {
        fn entry(_: usize) -> i32 {
            0
        }
        let t = Tcb::new("", priority::NORMAL, 512, entry, 0);
        assert_eq!(&*t.name, "-");
        assert_eq!(t.state, ThreadState::Inactive);
        assert_eq!(t.effective_priority, t.base_priority);
    }

    #[test]
    fn fresh_links_are_unlinked() {
        fn entry(_: usize) -> i32 {
            0
        }
        let t = Tcb::new("t", priority::LOW, 512, entry, 0);
        assert!(!t.queue_link.is_linked());
        assert!(!t.clock_link.is_linked());
    }
}
