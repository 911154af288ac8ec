#![expect(unsafe_code, reason = "raw node pointers published through atomics")]

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrder};
use std::{array, ptr, slice};

use oorandom::Rand32;
use parking_lot::Mutex;

use crate::arena::Arena;


/// The maximum height of any node. With branching factor 4, one node in
/// roughly four million reaches it.
pub(crate) const MAX_HEIGHT: usize = 12;
/// A node of height `h` is promoted to height `h + 1` with probability
/// `1 / BRANCHING`.
const BRANCHING: u32 = 4;

/// The ordering applied to entries in a [`Skiplist`].
///
/// Entries inserted into one list must all compare pairwise distinct.
pub trait KeyComparator: Send + Sync + 'static {
    fn cmp_entries(&self, a: &[u8], b: &[u8]) -> Ordering;
}

struct Node {
    /// Null exactly for the head node, which carries no entry.
    entry_ptr: *const u8,
    entry_len: usize,
    /// `next[level]` is the following node at `level`, or null. Levels at or
    /// above the node's height stay null forever and are never traversed.
    next:      [AtomicPtr<Node>; MAX_HEIGHT],
}

impl Node {
    fn new_head() -> *mut Self {
        Box::into_raw(Box::new(Self {
            entry_ptr: ptr::null(),
            entry_len: 0,
            next:      array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }))
    }

    /// # Safety
    /// Must not be called on the head node.
    unsafe fn entry<'a>(&self) -> &'a [u8] {
        debug_assert!(!self.entry_ptr.is_null(), "head node has no entry");
        // SAFETY: `entry_ptr` points to `entry_len` bytes in the list's arena,
        // which outlives every node. The caller's borrow of the list (direct
        // or through `Arc`) keeps the arena alive for 'a.
        unsafe { slice::from_raw_parts(self.entry_ptr, self.entry_len) }
    }
}

struct Writer {
    arena: Arena,
    rng:   Rand32,
}

/// A skiplist of byte-string entries ordered by a [`KeyComparator`].
///
/// Writers are serialized internally; readers run lock-free against the
/// atomically published node links. See the crate docs for the full
/// concurrency contract.
pub struct Skiplist<C> {
    cmp:        C,
    head:       *mut Node,
    /// Height of the tallest node ever inserted. Monotonically increasing.
    max_height: AtomicUsize,
    num_nodes:  AtomicUsize,
    node_bytes: AtomicUsize,
    writer:     Mutex<Writer>,
}

// SAFETY: all node and arena memory is owned by the list and freed only in
// `Drop`; shared mutation goes through atomics or the writer mutex.
unsafe impl<C: Send> Send for Skiplist<C> {}
// SAFETY: as above; readers only perform acquire loads of published pointers.
unsafe impl<C: Sync> Sync for Skiplist<C> {}

impl<C: KeyComparator> Skiplist<C> {
    #[must_use]
    pub fn new(cmp: C) -> Self {
        Self::with_seed(cmp, 0xdead_beef)
    }

    /// As [`Skiplist::new`], with an explicit seed for the height generator.
    #[must_use]
    pub fn with_seed(cmp: C, seed: u64) -> Self {
        Self {
            cmp,
            head:       Node::new_head(),
            max_height: AtomicUsize::new(1),
            num_nodes:  AtomicUsize::new(0),
            node_bytes: AtomicUsize::new(size_of::<Node>()),
            writer:     Mutex::new(Writer {
                arena: Arena::new(),
                rng:   Rand32::new(seed),
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.num_nodes.load(AtomicOrder::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A close lower bound on the bytes allocated by this list: arena chunks
    /// plus node overhead.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        let arena_bytes = self.writer.lock().arena.allocated_bytes();
        arena_bytes + self.node_bytes.load(AtomicOrder::Relaxed)
    }

    /// Insert an entry of exactly `entry_len` bytes, produced in place by
    /// `fill`.
    ///
    /// The new entry must compare distinct from every entry already in the
    /// list; otherwise iteration order over the duplicates is unspecified.
    pub fn insert_with(&self, entry_len: usize, fill: impl FnOnce(&mut [u8])) {
        let mut writer = self.writer.lock();

        let entry_ptr = writer.arena.allocate(entry_len);
        // SAFETY: the arena handed out `entry_len` bytes exclusive to this
        // insertion; nothing else can observe them until the node is linked.
        unsafe { fill(slice::from_raw_parts_mut(entry_ptr, entry_len)) };
        // SAFETY: as above; the bytes are now initialized.
        let entry = unsafe { slice::from_raw_parts(entry_ptr.cast_const(), entry_len) };

        let mut prev = [self.head.cast_const(); MAX_HEIGHT];
        self.find_greater_or_equal(entry, Some(&mut prev));

        let height = random_height(&mut writer.rng);
        let list_height = self.max_height.load(AtomicOrder::Relaxed);
        if height > list_height {
            // `prev` already holds the head for these levels.
            // Readers that see the old height simply skip the new levels;
            // readers that see the new height find null links from the head,
            // which is also fine.
            self.max_height.store(height, AtomicOrder::Relaxed);
        }

        let node = Box::into_raw(Box::new(Node {
            entry_ptr: entry_ptr.cast_const(),
            entry_len,
            next:      array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }));

        for (level, prev_node) in prev.iter().enumerate().take(height) {
            // SAFETY: `node` was just allocated; `prev_node` points to a live
            // node (head or earlier insertion).
            let prev_next = unsafe { &(**prev_node).next[level] };
            let old_next = prev_next.load(AtomicOrder::Relaxed);
            unsafe { &(*node).next[level] }.store(old_next, AtomicOrder::Relaxed);
            // The release store is what publishes the node (and its entry
            // bytes) to readers at this level.
            prev_next.store(node, AtomicOrder::Release);
        }

        self.num_nodes.fetch_add(1, AtomicOrder::Relaxed);
        self.node_bytes.fetch_add(size_of::<Node>(), AtomicOrder::Relaxed);
    }

    /// Whether an entry comparing equal to `entry` is present.
    #[must_use]
    pub fn contains(&self, entry: &[u8]) -> bool {
        let node = self.find_greater_or_equal(entry, None);
        // SAFETY: non-null nodes returned by the search are live and non-head.
        !node.is_null()
            && self.cmp.cmp_entries(unsafe { (*node).entry() }, entry) == Ordering::Equal
    }

    #[must_use]
    pub fn iter(&self) -> Iter<'_, C> {
        Iter {
            list: self,
            node: ptr::null(),
        }
    }

    /// An iterator that shares ownership of the list, for cursors that must
    /// outlive any particular borrow.
    #[must_use]
    pub fn owned_iter(self: &Arc<Self>) -> OwnedIter<C> {
        OwnedIter {
            list: Arc::clone(self),
            node: ptr::null(),
        }
    }

    /// The first node whose entry is `>= key`, or null.
    ///
    /// When `prev` is given, it is filled with the rightmost node strictly
    /// before `key` at every level (the insertion splice points).
    fn find_greater_or_equal(
        &self,
        key:  &[u8],
        mut prev: Option<&mut [*const Node; MAX_HEIGHT]>,
    ) -> *const Node {
        let mut node = self.head.cast_const();
        let mut level = self.max_height.load(AtomicOrder::Relaxed) - 1;

        loop {
            // SAFETY: `node` is the head or a published node; both are live.
            let next = unsafe { &(*node).next[level] }.load(AtomicOrder::Acquire);

            // SAFETY: a non-null `next` is a published non-head node.
            let next_is_smaller = !next.is_null()
                && self.cmp.cmp_entries(unsafe { (*next).entry() }, key) == Ordering::Less;

            if next_is_smaller {
                node = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = node;
                }
                if level == 0 {
                    return next.cast_const();
                }
                level -= 1;
            }
        }
    }

    /// The rightmost node whose entry is `< key`; the head if there is none.
    fn find_less_than(&self, key: &[u8]) -> *const Node {
        let mut node = self.head.cast_const();
        let mut level = self.max_height.load(AtomicOrder::Relaxed) - 1;

        loop {
            // SAFETY: `node` is the head or a published node; both are live.
            let next = unsafe { &(*node).next[level] }.load(AtomicOrder::Acquire);

            // SAFETY: a non-null `next` is a published non-head node.
            let next_is_smaller = !next.is_null()
                && self.cmp.cmp_entries(unsafe { (*next).entry() }, key) == Ordering::Less;

            if next_is_smaller {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// The last node in the list; the head if the list is empty.
    fn find_last(&self) -> *const Node {
        let mut node = self.head.cast_const();
        let mut level = self.max_height.load(AtomicOrder::Relaxed) - 1;

        loop {
            // SAFETY: `node` is the head or a published node; both are live.
            let next = unsafe { &(*node).next[level] }.load(AtomicOrder::Acquire);

            if !next.is_null() {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }
}

impl<C> Drop for Skiplist<C> {
    fn drop(&mut self) {
        // Nodes are only reachable through the level-0 chain and `self`;
        // having `&mut self` means no reader can observe them anymore.
        let mut node = self.head;
        while !node.is_null() {
            // SAFETY: every node in the chain came from `Box::into_raw` and
            // is freed exactly once here.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next[0].load(AtomicOrder::Relaxed);
        }
    }
}

impl<C> Debug for Skiplist<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Skiplist")
            .field("len", &self.num_nodes.load(AtomicOrder::Relaxed))
            .field("max_height", &self.max_height.load(AtomicOrder::Relaxed))
            .finish_non_exhaustive()
    }
}

fn random_height(rng: &mut Rand32) -> usize {
    let mut height = 1;
    while height < MAX_HEIGHT && rng.rand_u32() % BRANCHING == 0 {
        height += 1;
    }
    height
}

macro_rules! cursor_methods {
    () => {
        /// Whether the cursor currently rests on an entry.
        #[must_use]
        pub fn valid(&self) -> bool {
            !self.node.is_null()
        }

        #[must_use]
        pub fn current(&self) -> Option<&[u8]> {
            if self.node.is_null() {
                None
            } else {
                // SAFETY: a non-null cursor node is a live non-head node, and
                // the cursor (co-)owns or borrows the list.
                Some(unsafe { (*self.node).entry() })
            }
        }

        /// Advance to the following entry. From the not-`valid()` position
        /// this moves to the first entry; stepping past the last entry
        /// returns to the not-`valid()` position.
        pub fn next(&mut self) -> Option<&[u8]> {
            if self.node.is_null() {
                self.seek_to_first();
            } else {
                // SAFETY: the cursor node is live.
                self.node = unsafe { &(*self.node).next[0] }.load(AtomicOrder::Acquire);
            }
            self.current()
        }

        /// Step to the preceding entry. From the not-`valid()` position this
        /// moves to the last entry; stepping before the first entry returns
        /// to the not-`valid()` position.
        ///
        /// This searches from the list head, costing `O(log n)`.
        pub fn prev(&mut self) -> Option<&[u8]> {
            if self.node.is_null() {
                self.seek_to_last();
            } else {
                // SAFETY: the cursor node is live and non-head.
                let entry = unsafe { (*self.node).entry() };
                let less = self.list.find_less_than(entry);
                self.node = if less == self.list.head.cast_const() {
                    ptr::null()
                } else {
                    less
                };
            }
            self.current()
        }

        /// Move to the first entry `>= key`, or to the not-`valid()` position
        /// if every entry is smaller.
        pub fn seek(&mut self, key: &[u8]) {
            self.node = self.list.find_greater_or_equal(key, None);
        }

        pub fn seek_to_first(&mut self) {
            // SAFETY: the head node is live.
            self.node = unsafe { &(*self.list.head).next[0] }.load(AtomicOrder::Acquire);
        }

        pub fn seek_to_last(&mut self) {
            let last = self.list.find_last();
            self.node = if last == self.list.head.cast_const() {
                ptr::null()
            } else {
                last
            };
        }

        /// Return to the initial, not-`valid()` position.
        pub fn reset(&mut self) {
            self.node = ptr::null();
        }
    };
}

/// A cursor borrowing the list. See [`Skiplist::iter`].
pub struct Iter<'a, C> {
    list: &'a Skiplist<C>,
    node: *const Node,
}

impl<C: KeyComparator> Iter<'_, C> {
    cursor_methods!();
}

impl<C> Debug for Iter<'_, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Iter").field("valid", &!self.node.is_null()).finish()
    }
}

// SAFETY: the cursor only holds a pointer into the (Sync) list it borrows.
unsafe impl<C: Sync> Send for Iter<'_, C> {}

/// A cursor sharing ownership of the list. See [`Skiplist::owned_iter`].
pub struct OwnedIter<C> {
    list: Arc<Skiplist<C>>,
    node: *const Node,
}

impl<C: KeyComparator> OwnedIter<C> {
    cursor_methods!();
}

impl<C> Debug for OwnedIter<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("OwnedIter").field("valid", &!self.node.is_null()).finish()
    }
}

// SAFETY: the cursor keeps the list alive through its `Arc`; the node pointer
// is only dereferenced while the list is alive.
unsafe impl<C: Send + Sync> Send for OwnedIter<C> {}


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct Bytewise;

    impl KeyComparator for Bytewise {
        fn cmp_entries(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
    }

    fn insert(list: &Skiplist<Bytewise>, entry: &[u8]) {
        list.insert_with(entry.len(), |out| out.copy_from_slice(entry));
    }

    fn list_of(entries: &[&[u8]]) -> Skiplist<Bytewise> {
        let list = Skiplist::new(Bytewise);
        for entry in entries {
            insert(&list, entry);
        }
        list
    }

    #[test]
    fn iterates_in_order() {
        let list = list_of(&[b"delta", b"alpha", b"charlie", b"bravo"]);
        assert_eq!(list.len(), 4);

        let mut iter = list.iter();
        let mut collected = Vec::new();
        while let Some(entry) = iter.next() {
            collected.push(entry.to_vec());
        }
        assert_eq!(collected, vec![
            b"alpha".to_vec(), b"bravo".to_vec(), b"charlie".to_vec(), b"delta".to_vec(),
        ]);

        // The cursor wrapped around to the phantom position.
        assert!(!iter.valid());
        assert_eq!(iter.next().unwrap(), b"alpha");
    }

    #[test]
    fn seek_finds_lower_bound() {
        let list = list_of(&[b"b", b"d", b"f"]);
        let mut iter = list.iter();

        iter.seek(b"c");
        assert_eq!(iter.current().unwrap(), b"d");

        iter.seek(b"d");
        assert_eq!(iter.current().unwrap(), b"d");

        iter.seek(b"g");
        assert!(!iter.valid());
    }

    #[test]
    fn prev_steps_backwards() {
        let list = list_of(&[b"b", b"d", b"f"]);
        let mut iter = list.iter();

        iter.seek_to_last();
        assert_eq!(iter.current().unwrap(), b"f");
        assert_eq!(iter.prev().unwrap(), b"d");
        assert_eq!(iter.prev().unwrap(), b"b");
        assert!(iter.prev().is_none());
        assert!(!iter.valid());

        // And from the phantom position, `prev` goes to the last entry.
        assert_eq!(iter.prev().unwrap(), b"f");
    }

    #[test]
    fn contains_and_empty() {
        let list = list_of(&[]);
        assert!(list.is_empty());
        let mut iter = list.iter();
        assert!(iter.next().is_none());
        assert!(iter.prev().is_none());

        insert(&list, b"only");
        assert!(list.contains(b"only"));
        assert!(!list.contains(b"missing"));
        assert!(list.allocated_bytes() > 0);
    }

    #[test]
    fn owned_iter_reads_concurrent_inserts() {
        let list = Arc::new(Skiplist::new(Bytewise));
        for i in 0..50_u32 {
            let entry = format!("key{i:04}");
            insert(&list, entry.as_bytes());
        }

        let reader = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                let mut iter = list.owned_iter();
                let mut seen = 0;
                while iter.next().is_some() {
                    seen += 1;
                }
                seen
            })
        };

        for i in 50..100_u32 {
            let entry = format!("key{i:04}");
            insert(&list, entry.as_bytes());
        }

        let seen = reader.join().unwrap();
        assert!(seen >= 50, "reader saw {seen} entries");
        assert_eq!(list.len(), 100);
    }

    #[test]
    fn large_entries_get_dedicated_chunks() {
        let list = Skiplist::new(Bytewise);
        let big = vec![b'x'; 8000];
        insert(&list, &big);
        insert(&list, b"small");

        let mut iter = list.iter();
        iter.seek_to_first();
        assert_eq!(iter.current().unwrap(), b"small");
        assert_eq!(iter.next().unwrap().len(), 8000);
        assert!(list.allocated_bytes() >= 8000);
    }
}
