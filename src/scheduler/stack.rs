//! Thread stacks and saved execution contexts
//!
//! The kernel core is port-agnostic: it owns each thread's stack region and
//! a saved-context record, and asks the port to perform the actual register
//! save/restore. The portable build records the hand-off and nothing else; a
//! hardware port replaces [`Context::switch`] with its real context switch.

use alloc::boxed::Box;
use alloc::vec;

/// Minimum accepted stack size, matching the smallest frame the port needs.
pub const MIN_STACK_SIZE: usize = 256;

/// Default stack size for threads that do not specify one.
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// Owned stack region of a thread. Reclaimed when the thread is reaped.
pub struct Stack {
    mem: Box<[u8]>,
}

impl Stack {
    pub fn new(size: usize) -> Self {
        let size = size.max(MIN_STACK_SIZE);
        Self {
            mem: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// Address one past the highest byte; stacks grow down.
    pub fn top(&self) -> usize {
        self.mem.as_ptr() as usize + self.mem.len()
    }
}

/// Saved execution context of a thread.
#[derive(Debug, Default)]
pub struct Context {
    /// Saved stack pointer
    pub sp: usize,
    /// Resume address (entry trampoline before first dispatch)
    pub pc: usize,
    /// Times this context has been switched in
    pub switches: u64,
}

impl Context {
    /// Prepare an initial context that would enter `entry_pc` on `stack`.
    pub fn prepare(stack: &Stack, entry_pc: usize) -> Self {
        Self {
            sp: stack.top(),
            pc: entry_pc,
            switches: 0,
        }
    }

    /// Port hook: hand the CPU from `old` to `new`.
    pub fn switch(old: &mut Context, new: &mut Context) {
        // Portable build: bookkeeping only. A hardware port saves the callee
        // registers of `old` and restores `new` here.
        let _ = &old.sp;
        new.switches += 1;
    }
}
