//! Critical-section guard
//!
//! The single point of mutual exclusion for the whole kernel. Every state
//! mutation (wait-list links, mutex ownership, counters, queue slots)
//! happens inside one scoped [`CriticalCell::with`] call, which masks
//! interrupts for the duration and takes the kernel-state lock. No primitive
//! layers a second lock on top.
//!
//! The interrupt mask nests: re-entering from a nested port-level section
//! only bumps a depth counter, and the mask is released when the outermost
//! section ends. The data lock itself is taken exactly once per kernel
//! operation; kernel internals compose on `&mut` state, never by re-locking.

use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// Scoped, re-entrant-safe interrupt mask.
///
/// The portable build tracks depth only; a hardware port disables interrupts
/// on the 0 -> 1 edge and re-enables them on 1 -> 0.
pub struct InterruptMask<'a> {
    depth: &'a AtomicU32,
}

impl<'a> InterruptMask<'a> {
    pub fn enter(depth: &'a AtomicU32) -> Self {
        let prev = depth.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            // Port hook: mask interrupts here.
        }
        Self { depth }
    }
}

impl Drop for InterruptMask<'_> {
    fn drop(&mut self) {
        let prev = self.depth.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            // Port hook: restore the saved interrupt state here.
        }
    }
}

/// Kernel state behind the critical-section guard.
pub struct CriticalCell<T> {
    mask_depth: AtomicU32,
    inner: Mutex<T>,
}

impl<T> CriticalCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            mask_depth: AtomicU32::new(0),
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with interrupts masked and the state lock held. Keep the body
    /// short: this bounds the kernel's preemption latency.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _mask = InterruptMask::enter(&self.mask_depth);
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Current mask nesting depth (diagnostics).
    pub fn mask_depth(&self) -> u32 {
        self.mask_depth.load(Ordering::Acquire)
    }
}
