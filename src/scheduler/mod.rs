//! Thread scheduling subsystem
//!
//! The thread control block and its state machine, stack/context ownership,
//! and the priority-preemptive scheduler core.

pub mod scheduler;
pub mod stack;
pub mod state;
pub mod thread;

pub use stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use state::ThreadState;
pub use thread::{priority, Entry, ThreadId, WaitTarget, WakeReason};
