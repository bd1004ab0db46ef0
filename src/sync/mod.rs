//! Synchronization primitives
//!
//! Every primitive is a record in a kernel arena with one or two
//! priority-ordered wait lists; all of them share the scheduler's
//! park/wake machinery and the single critical section.

pub mod condvar;
pub mod critical;
pub mod flags;
pub mod mqueue;
pub mod mutex;
pub mod semaphore;

pub use condvar::CondvarId;
pub use critical::CriticalCell;
pub use flags::{FlagsId, FlagsMode};
pub use mqueue::{Message, QueueId};
pub use mutex::{Consistency, MutexId, MutexKind, Protocol, Robustness};
pub use semaphore::SemaphoreId;
