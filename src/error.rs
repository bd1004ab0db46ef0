//! Kernel result codes
//!
//! Every fallible kernel operation returns one code from a fixed, errno-style
//! domain. Primitives never swallow a failure: each error path maps to a
//! specific variant, and callers branch on the code.

use core::fmt;

/// Kernel error codes, shared across every primitive.
///
/// The domain intentionally mirrors the standard I/O error conventions so the
/// POSIX-style layers sitting on top of the kernel can pass codes through
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Resource is held or full and the call was non-blocking (EBUSY/EAGAIN)
    Busy,

    /// A timed wait reached its absolute deadline (ETIMEDOUT)
    TimedOut,

    /// A wait was cancelled by an explicit interrupt request (EINTR)
    Interrupted,

    /// Malformed argument: stale handle, reserved priority, zero period (EINVAL)
    InvalidArgument,

    /// Operation not permitted from this context, e.g. a blocking call from
    /// an interrupt handler or an unlock by a non-owner (EPERM)
    NotPermitted,

    /// Relock of a non-recursive mutex by its owner (EDEADLK)
    Deadlock,

    /// A robust mutex owner terminated while holding it; the new owner must
    /// recover and acknowledge (EOWNERDEAD)
    OwnerDied,

    /// A robust mutex was released without acknowledgement after an owner
    /// death; the protected state is unrecoverable (ENOTRECOVERABLE)
    Unrecoverable,

    /// Message exceeds the queue's configured message size (EMSGSIZE)
    MessageTooLarge,

    /// A counter or recursion depth would exceed its configured maximum
    /// (EOVERFLOW)
    Overflow,

    /// An object is in the wrong lifecycle state for the operation, e.g.
    /// starting an already-started thread (EINVAL family, kept distinct)
    InvalidState,

    /// Allocation of kernel storage failed (ENOMEM)
    NoMemory,
}

impl Errno {
    /// Resource-contention errors are expected and recoverable; the caller
    /// decides whether to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::TimedOut | Self::Interrupted)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "resource busy"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Interrupted => write!(f, "wait interrupted"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotPermitted => write!(f, "operation not permitted"),
            Self::Deadlock => write!(f, "deadlock detected"),
            Self::OwnerDied => write!(f, "mutex owner died"),
            Self::Unrecoverable => write!(f, "protected state unrecoverable"),
            Self::MessageTooLarge => write!(f, "message too large"),
            Self::Overflow => write!(f, "value would exceed maximum"),
            Self::InvalidState => write!(f, "object in invalid state"),
            Self::NoMemory => write!(f, "out of kernel memory"),
        }
    }
}

/// Kernel result type.
pub type Result<T> = core::result::Result<T, Errno>;

/// What happened to the caller of a potentially blocking operation.
///
/// The kernel core is driven deterministically by its port (or by a test
/// harness): when a blocking call cannot complete at once, the calling thread
/// is parked on a wait list and the scheduler switches away. The eventual
/// outcome of the wait is reported through the thread's wake reason.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T = ()> {
    /// The operation completed without blocking.
    Done(Result<T>),

    /// The calling thread was moved to a wait list; query its wake reason
    /// once it has been scheduled again.
    Parked,
}

impl<T> Outcome<T> {
    /// Unwrap the synchronous result. Panics on [`Outcome::Parked`]; meant
    /// for paths that are known not to block (and for tests).
    #[track_caller]
    pub fn done(self) -> Result<T> {
        match self {
            Self::Done(r) => r,
            Self::Parked => panic!("operation parked, no synchronous result"),
        }
    }

    /// True if the caller was parked.
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::Parked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        assert!(Errno::Busy.is_transient());
        assert!(Errno::TimedOut.is_transient());
        assert!(!Errno::Deadlock.is_transient());
        assert!(!Errno::Unrecoverable.is_transient());
    }

    #[test]
    fn display_is_specific() {
        assert_eq!(alloc::format!("{}", Errno::OwnerDied), "mutex owner died");
        assert_eq!(alloc::format!("{}", Errno::TimedOut), "timed out");
    }
}
