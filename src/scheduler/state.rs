//! Thread state machine
//!
//! Lifecycle: Inactive -> Ready <-> Running -> Waiting -> ... -> Terminated
//! -> Destroyed. Only the scheduler performs Running/Ready/Waiting moves;
//! primitives request them through the scheduler. Terminated and Destroyed
//! are terminal, and a destroyed thread's slot is reusable only after an
//! explicit reap.

use core::fmt;

/// Thread lifecycle state.
///
/// There is no `Undefined` variant: before construction completes the thread
/// simply does not exist in the arena, which is what "unreachable after
/// construction" means here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Constructed, not yet handed to the scheduler
    Inactive = 0,

    /// Eligible to run, linked in the ready queue
    Ready = 1,

    /// The single thread currently executing
    Running = 2,

    /// Parked on a wait list or a clock deadline
    Waiting = 3,

    /// Entry function returned or the thread was stopped; awaiting reap
    Terminated = 4,

    /// Reaped; the slot is being reclaimed
    Destroyed = 5,
}

impl ThreadState {
    /// Terminal states never transition again (except Terminated -> Destroyed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Destroyed)
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Waiting)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "Inactive",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Waiting => "Waiting",
            Self::Terminated => "Terminated",
            Self::Destroyed => "Destroyed",
        };
        f.write_str(name)
    }
}

/// Validate a lifecycle transition.
///
/// The scheduler checks contract-facing transitions before performing them;
/// anything that reaches an invalid transition past those checks is kernel
/// corruption, not caller error.
pub fn validate_transition(from: ThreadState, to: ThreadState) -> bool {
    use ThreadState::*;

    match (from, to) {
        // Start
        (Inactive, Ready) => true,

        // Dispatch and preemption
        (Ready, Running) => true,
        (Running, Ready) => true,

        // Blocking and wakeup
        (Running, Waiting) => true,
        (Waiting, Ready) => true,

        // Exit and kill
        (Running, Terminated) => true,
        (Ready, Terminated) => true,
        (Waiting, Terminated) => true,
        (Inactive, Terminated) => true,

        // Reap
        (Terminated, Destroyed) => true,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadState::*;
    use super::*;

    #[test]
    fn lifecycle_round_trip() {
        assert!(validate_transition(Inactive, Ready));
        assert!(validate_transition(Ready, Running));
        assert!(validate_transition(Running, Waiting));
        assert!(validate_transition(Waiting, Ready));
        assert!(validate_transition(Running, Terminated));
        assert!(validate_transition(Terminated, Destroyed));
    }

    #[test]
    fn terminal_states_are_sinks() {
        assert!(!validate_transition(Terminated, Ready));
        assert!(!validate_transition(Destroyed, Ready));
        assert!(!validate_transition(Terminated, Running));
    }

    #[test]
    fn no_shortcuts() {
        assert!(!validate_transition(Inactive, Running));
        assert!(!validate_transition(Waiting, Running));
        assert!(!validate_transition(Ready, Waiting));
    }
}
