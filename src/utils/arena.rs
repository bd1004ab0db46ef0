//! Generational arena
//!
//! All kernel objects (threads, mutexes, timers, ...) live in arenas and are
//! addressed by copyable typed handles instead of raw back-pointers. A handle
//! carries the slot's generation, so a handle kept across an object's
//! destruction and slot reuse is detected instead of aliasing the new object.

use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// Typed handle into an [`Arena<T>`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _owner: PhantomData<fn() -> T>,
}

// Manual impls: derives would require `T: Copy` etc. even though the handle
// never holds a `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}
impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}
impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

impl<T> Handle<T> {
    /// Slot index; stable for the lifetime of the object.
    pub fn index(&self) -> u32 {
        self.index
    }
}

struct Slot<T> {
    generation: u32,
    payload: Option<T>,
}

fn vetted<T>(slot: &mut Slot<T>, handle: Handle<T>) -> Option<&mut T> {
    if slot.generation == handle.generation {
        slot.payload.as_mut()
    } else {
        None
    }
}

/// Growable arena with generation-checked slot reuse.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `value`, reusing a vacated slot when one exists.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.payload.is_none());
            slot.payload = Some(value);
            Handle {
                index,
                generation: slot.generation,
                _owner: PhantomData,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                payload: Some(value),
            });
            Handle {
                index,
                generation: 0,
                _owner: PhantomData,
            }
        }
    }

    /// Remove the object behind `handle`. Stale handles return `None`.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.payload.is_none() {
            return None;
        }
        let value = slot.payload.take();
        // Bump the generation so outstanding handles to the old object miss.
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        value
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.payload.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.payload.as_mut()
    }

    /// Mutable borrows of two distinct live objects at once. Panics when the
    /// handles share a slot.
    pub fn get2_mut(
        &mut self,
        a: Handle<T>,
        b: Handle<T>,
    ) -> (Option<&mut T>, Option<&mut T>) {
        assert_ne!(a.index, b.index, "aliasing arena borrow");
        let (lo, hi, swapped) = if a.index < b.index {
            (a, b, false)
        } else {
            (b, a, true)
        };
        if hi.index as usize >= self.slots.len() {
            let lo_ref = self.get_mut(lo);
            return if swapped { (None, lo_ref) } else { (lo_ref, None) };
        }
        let (left, right) = self.slots.split_at_mut(hi.index as usize);
        let lo_ref = left.get_mut(lo.index as usize).and_then(|s| vetted(s, lo));
        let hi_ref = right.get_mut(0).and_then(|s| vetted(s, hi));
        if swapped {
            (hi_ref, lo_ref)
        } else {
            (lo_ref, hi_ref)
        }
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Handles of every live object, in slot order.
    pub fn handles(&self) -> Vec<Handle<T>> {
        let mut out = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.payload.is_some() {
                out.push(Handle {
                    index: index as u32,
                    generation: slot.generation,
                    _owner: PhantomData,
                });
            }
        }
        out
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena: Arena<u32> = Arena::new();
        let a = arena.insert(7);
        let b = arena.insert(9);
        assert_eq!(arena.get(a), Some(&7));
        assert_eq!(arena.get(b), Some(&9));
        assert_eq!(arena.remove(a), Some(7));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_handle_detected_after_reuse() {
        let mut arena: Arena<u32> = Arena::new();
        let a = arena.insert(1);
        arena.remove(a);
        let b = arena.insert(2);
        // Slot reused but generation bumped.
        assert_eq!(b.index(), a.index());
        assert_ne!(a, b);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.remove(a), None);
    }

    #[test]
    fn disjoint_pair_borrow() {
        let mut arena: Arena<u32> = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let (ra, rb) = arena.get2_mut(a, b);
        *ra.unwrap() += 10;
        *rb.unwrap() += 20;
        assert_eq!(arena.get(a), Some(&11));
        assert_eq!(arena.get(b), Some(&22));
        let (rb, ra) = arena.get2_mut(b, a);
        assert_eq!(rb, Some(&mut 22));
        assert_eq!(ra, Some(&mut 11));
    }

    #[test]
    fn stale_half_of_a_pair_borrow_misses() {
        let mut arena: Arena<u32> = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        arena.remove(b);
        let c = arena.insert(3);
        let (ra, rb) = arena.get2_mut(a, b);
        assert_eq!(ra, Some(&mut 1));
        assert_eq!(rb, None);
        let (ra, rc) = arena.get2_mut(a, c);
        assert_eq!(ra, Some(&mut 1));
        assert_eq!(rc, Some(&mut 3));
    }

    #[test]
    fn handles_lists_live_objects() {
        let mut arena: Arena<&str> = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        arena.remove(a);
        assert_eq!(arena.handles(), alloc::vec![b]);
    }
}
