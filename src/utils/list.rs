//! Arena-index intrusive lists
//!
//! The wait lists, the ready queue and the clock's deadline lists are all
//! doubly-linked lists threaded through the objects themselves, with arena
//! handles in place of raw prev/next pointers. A node records whether it is
//! linked, which makes removal idempotent: unlinking an already-unlinked node
//! is a no-op, exactly what the timeout-versus-explicit-wake race requires.
//!
//! An [`Adapter`] names which link field of the element a given list uses, so
//! one object can sit in several lists at once through distinct nodes (a
//! thread has one node for its wait list and one for the clock's deadline
//! list).

use super::arena::{Arena, Handle};
use alloc::vec::Vec;
use core::marker::PhantomData;

/// Intrusive link node embedded in a list element.
///
/// `key` is the ordering key recorded at insert time: the waker's effective
/// priority for wait lists, the absolute wake tick for deadline lists.
#[derive(Debug)]
pub struct Link<T> {
    next: Option<Handle<T>>,
    prev: Option<Handle<T>>,
    linked: bool,
    key: u64,
}

impl<T> Link<T> {
    pub const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            linked: false,
            key: 0,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn key(&self) -> u64 {
        self.key
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Selects which [`Link`] field of `T` a list operates on.
pub trait Adapter<T> {
    fn link(item: &T) -> &Link<T>;
    fn link_mut(item: &mut T) -> &mut Link<T>;
}

/// Ordered intrusive list over arena elements.
pub struct List<T, A: Adapter<T>> {
    head: Option<Handle<T>>,
    tail: Option<Handle<T>>,
    len: usize,
    _adapter: PhantomData<fn() -> A>,
}

impl<T, A: Adapter<T>> List<T, A> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _adapter: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<Handle<T>> {
        self.head
    }

    /// Ordering key of the head element, if any.
    pub fn front_key(&self, arena: &Arena<T>) -> Option<u64> {
        let head = self.head?;
        arena.get(head).map(|item| A::link(item).key())
    }

    /// Insert keeping keys ascending; equal keys keep arrival order (FIFO).
    /// Used by the clock's deadline lists (key = absolute wake tick).
    pub fn insert_ascending(&mut self, arena: &mut Arena<T>, handle: Handle<T>, key: u64) {
        // First element with a strictly greater key goes after us.
        let mut at = self.head;
        while let Some(h) = at {
            let item = arena.get(h).expect("kernel list references dead slot");
            if A::link(item).key() > key {
                break;
            }
            at = A::link(item).next;
        }
        self.insert_before(arena, handle, key, at);
    }

    /// Insert keeping keys descending; equal keys keep arrival order (FIFO).
    /// Used by ready and wait lists (key = effective priority).
    pub fn insert_descending(&mut self, arena: &mut Arena<T>, handle: Handle<T>, key: u64) {
        let mut at = self.head;
        while let Some(h) = at {
            let item = arena.get(h).expect("kernel list references dead slot");
            if A::link(item).key() < key {
                break;
            }
            at = A::link(item).next;
        }
        self.insert_before(arena, handle, key, at);
    }

    fn insert_before(
        &mut self,
        arena: &mut Arena<T>,
        handle: Handle<T>,
        key: u64,
        before: Option<Handle<T>>,
    ) {
        let prev = match before {
            Some(b) => {
                let item = arena.get(b).expect("kernel list references dead slot");
                A::link(item).prev
            }
            None => self.tail,
        };

        {
            let item = arena.get_mut(handle).expect("kernel list inserts dead slot");
            let link = A::link_mut(item);
            assert!(!link.linked, "kernel list node already linked");
            link.linked = true;
            link.key = key;
            link.prev = prev;
            link.next = before;
        }
        match prev {
            Some(p) => A::link_mut(arena.get_mut(p).expect("list prev dead")).next = Some(handle),
            None => self.head = Some(handle),
        }
        match before {
            Some(b) => A::link_mut(arena.get_mut(b).expect("list next dead")).prev = Some(handle),
            None => self.tail = Some(handle),
        }
        self.len += 1;
    }

    /// Unlink `handle` if present. Idempotent: returns false when the node is
    /// not linked (already removed by the other side of a wake race) or the
    /// handle is stale.
    pub fn remove(&mut self, arena: &mut Arena<T>, handle: Handle<T>) -> bool {
        let (prev, next) = match arena.get_mut(handle) {
            Some(item) => {
                let link = A::link_mut(item);
                if !link.linked {
                    return false;
                }
                let pair = (link.prev, link.next);
                link.linked = false;
                link.prev = None;
                link.next = None;
                pair
            }
            None => return false,
        };
        match prev {
            Some(p) => A::link_mut(arena.get_mut(p).expect("list prev dead")).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => A::link_mut(arena.get_mut(n).expect("list next dead")).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        true
    }

    /// Unlink and return the head element.
    pub fn pop_front(&mut self, arena: &mut Arena<T>) -> Option<Handle<T>> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    /// Snapshot of the current membership, head to tail. Taken before
    /// walking-and-waking so the walk survives removals.
    pub fn iter_handles(&self, arena: &Arena<T>) -> Vec<Handle<T>> {
        let mut out = Vec::with_capacity(self.len);
        let mut at = self.head;
        while let Some(h) = at {
            out.push(h);
            at = A::link(arena.get(h).expect("kernel list references dead slot")).next;
        }
        out
    }
}

impl<T, A: Adapter<T>> Default for List<T, A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        link: Link<Item>,
        tag: char,
    }

    impl Item {
        fn new(tag: char) -> Self {
            Self {
                link: Link::new(),
                tag,
            }
        }
    }

    struct ByLink;
    impl Adapter<Item> for ByLink {
        fn link(item: &Item) -> &Link<Item> {
            &item.link
        }
        fn link_mut(item: &mut Item) -> &mut Link<Item> {
            &mut item.link
        }
    }

    fn tags(list: &List<Item, ByLink>, arena: &Arena<Item>) -> alloc::string::String {
        list.iter_handles(arena)
            .into_iter()
            .map(|h| arena.get(h).unwrap().tag)
            .collect()
    }

    #[test]
    fn descending_is_stable_within_equal_keys() {
        let mut arena = Arena::new();
        let mut list: List<Item, ByLink> = List::new();
        let a = arena.insert(Item::new('a'));
        let b = arena.insert(Item::new('b'));
        let c = arena.insert(Item::new('c'));
        let d = arena.insert(Item::new('d'));
        list.insert_descending(&mut arena, a, 10);
        list.insert_descending(&mut arena, b, 20);
        list.insert_descending(&mut arena, c, 10);
        list.insert_descending(&mut arena, d, 20);
        // b and d share the top key in arrival order, then a and c.
        assert_eq!(tags(&list, &arena), "bdac");
    }

    #[test]
    fn ascending_orders_deadlines() {
        let mut arena = Arena::new();
        let mut list: List<Item, ByLink> = List::new();
        let a = arena.insert(Item::new('a'));
        let b = arena.insert(Item::new('b'));
        let c = arena.insert(Item::new('c'));
        list.insert_ascending(&mut arena, a, 30);
        list.insert_ascending(&mut arena, b, 10);
        list.insert_ascending(&mut arena, c, 30);
        assert_eq!(tags(&list, &arena), "bac");
        assert_eq!(list.front_key(&arena), Some(10));
    }

    #[test]
    fn removal_is_idempotent() {
        let mut arena = Arena::new();
        let mut list: List<Item, ByLink> = List::new();
        let a = arena.insert(Item::new('a'));
        let b = arena.insert(Item::new('b'));
        list.insert_ascending(&mut arena, a, 1);
        list.insert_ascending(&mut arena, b, 2);
        assert!(list.remove(&mut arena, a));
        assert!(!list.remove(&mut arena, a));
        assert_eq!(list.len(), 1);
        assert_eq!(list.front(), Some(b));
    }

    #[test]
    fn pop_front_unlinks() {
        let mut arena = Arena::new();
        let mut list: List<Item, ByLink> = List::new();
        let a = arena.insert(Item::new('a'));
        list.insert_descending(&mut arena, a, 5);
        assert_eq!(list.pop_front(&mut arena), Some(a));
        assert!(list.is_empty());
        assert!(!arena.get(a).unwrap().link.is_linked());
    }
}
