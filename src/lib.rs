//! # kairos
//!
//! Deterministic priority-preemptive RTOS kernel core: thread lifecycle and
//! scheduling, priority-inheritance mutexes, semaphores, condition
//! variables, event flags, priority message queues, software timers and a
//! tick clock.
//!
//! The kernel is a library. A [`Kernel`] instance owns every kernel object
//! and is driven from outside: a board port calls the public operations on
//! behalf of the running thread and advances time with [`Kernel::tick`];
//! interrupt handlers run inside [`Kernel::interrupt`] brackets. Instances
//! are fully isolated, so tests build as many kernels as they need.
//!
//! Potentially-blocking operations return an [`Outcome`]: either a
//! synchronous [`Result`], or `Parked` when the calling thread was moved to
//! a wait list. The wait's eventual outcome is reported through the thread's
//! [`WakeReason`] once it is scheduled again.
//!
//! ```
//! use kairos::{Kernel, priority};
//!
//! fn worker(_arg: usize) -> i32 {
//!     0
//! }
//!
//! let k = Kernel::new();
//! let tid = k.spawn("worker", priority::NORMAL, worker, 0).unwrap();
//! assert_eq!(k.current(), tid);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub(crate) mod contract;
pub mod error;
pub mod kernel;
pub mod scheduler;
pub mod sync;
pub mod time;
pub mod utils;

pub use error::{Errno, Outcome, Result};
pub use kernel::{Kernel, KernelStats};
pub use scheduler::{priority, Entry, ThreadId, ThreadState, WakeReason};
pub use sync::{
    CondvarId, FlagsId, FlagsMode, Message, MutexId, MutexKind, Protocol, QueueId, Robustness,
    SemaphoreId,
};
pub use time::{Duration, Instant, TimerCallback, TimerId, TimerKind, TICK_HZ};
