//! The in-memory write buffer: a skiplist of framed internal entries.
//!
//! Each entry is `varint32(len) || internal_key || varint32(len) || value`;
//! deletions store an empty value. Entries are unique because every write
//! consumes a fresh sequence number.

use std::cmp::Ordering;
use std::sync::Arc;

use integer_encoding::VarIntWriter as _;

use silt_skiplist::{KeyComparator, OwnedIter, Skiplist};
use silt_sstable::Comparator as _;

use crate::error::Result;
use crate::format::{
    InternalKeyComparator, LookupKey, ParsedInternalKey, SequenceNumber, ValueType,
    decode_length_prefixed, pack_tag,
};
use crate::iter::InternalIterator;


/// Orders framed memtable entries by their embedded internal key.
#[derive(Debug, Clone)]
pub(crate) struct MemtableEntryComparator {
    icmp: InternalKeyComparator,
}

impl KeyComparator for MemtableEntryComparator {
    fn cmp_entries(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a_key = framed_internal_key(a);
        let b_key = framed_internal_key(b);
        self.icmp.cmp(a_key, b_key)
    }
}

/// The internal key inside a framed entry (or lookup key).
///
/// Entries are only ever written by [`Memtable::add`], so the framing is
/// trusted here; corruption cannot reach the memtable.
fn framed_internal_key(entry: &[u8]) -> &[u8] {
    let (internal_key, _) =
        decode_length_prefixed(entry).expect("memtable entries are well-framed");
    internal_key
}

/// The mutable (or sealed-but-unflushed) write buffer. Shared via `Arc`;
/// writers are serialized by the database mutex, readers are not.
#[derive(Debug)]
pub(crate) struct Memtable {
    list: Arc<Skiplist<MemtableEntryComparator>>,
    icmp: InternalKeyComparator,
}

impl Memtable {
    #[must_use]
    pub(crate) fn new(icmp: InternalKeyComparator) -> Self {
        let entry_cmp = MemtableEntryComparator { icmp: icmp.clone() };
        Self {
            list: Arc::new(Skiplist::new(entry_cmp)),
            icmp,
        }
    }

    /// A close lower bound on the bytes this memtable holds; compared
    /// against `write_buffer_size` to decide when to seal it.
    #[must_use]
    pub(crate) fn approximate_memory_usage(&self) -> usize {
        self.list.allocated_bytes()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Insert one entry. The (sequence, type) pair must be fresh.
    pub(crate) fn add(
        &self,
        sequence:   SequenceNumber,
        value_type: ValueType,
        user_key:   &[u8],
        value:      &[u8],
    ) {
        let internal_key_len = user_key.len() + 8;
        let mut framed = Vec::with_capacity(internal_key_len + value.len() + 10);
        framed
            .write_varint(internal_key_len as u32)
            .expect("writing to a Vec cannot fail");
        framed.extend_from_slice(user_key);
        framed.extend_from_slice(&pack_tag(sequence, value_type).to_le_bytes());
        framed
            .write_varint(value.len() as u32)
            .expect("writing to a Vec cannot fail");
        framed.extend_from_slice(value);

        self.list
            .insert_with(framed.len(), |out| out.copy_from_slice(&framed));
    }

    /// Look up the newest entry for the lookup key's user key at or below
    /// its sequence.
    ///
    /// `None`: this memtable says nothing about the key. `Some(None)`: the
    /// key was deleted. `Some(Some(value))`: the key has this value.
    #[must_use]
    pub(crate) fn get(&self, lookup: &LookupKey) -> Option<Option<Vec<u8>>> {
        let mut iter = self.list.iter();
        iter.seek(lookup.memtable_key());

        let entry = iter.current()?;
        let (internal_key, rest) =
            decode_length_prefixed(entry).expect("memtable entries are well-framed");
        let parsed =
            ParsedInternalKey::decode(internal_key).expect("memtable keys are well-formed");

        if self.icmp.cmp_user(parsed.user_key, lookup.user_key()) != Ordering::Equal {
            return None;
        }
        match parsed.value_type {
            ValueType::Deletion => Some(None),
            ValueType::Value => {
                let (value, _) =
                    decode_length_prefixed(rest).expect("memtable entries are well-framed");
                Some(Some(value.to_vec()))
            }
        }
    }

    /// An iterator at internal-key granularity, co-owning the memtable's
    /// skiplist (so it may outlive this particular `Arc<Memtable>` clone).
    #[must_use]
    pub(crate) fn iter(&self) -> MemtableIter {
        MemtableIter {
            inner:  self.list.owned_iter(),
            target: Vec::new(),
        }
    }
}

/// See [`Memtable::iter`].
#[derive(Debug)]
pub(crate) struct MemtableIter {
    inner:  OwnedIter<MemtableEntryComparator>,
    /// Scratch for framing seek targets in memtable-entry form.
    target: Vec<u8>,
}

impl InternalIterator for MemtableIter {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        self.target.clear();
        self.target
            .write_varint(target.len() as u32)
            .expect("writing to a Vec cannot fail");
        self.target.extend_from_slice(target);
        let framed = std::mem::take(&mut self.target);
        self.inner.seek(&framed);
        self.target = framed;
    }

    fn next(&mut self) {
        let _ = self.inner.next();
    }

    fn prev(&mut self) {
        let _ = self.inner.prev();
    }

    fn key(&self) -> &[u8] {
        let entry = self.inner.current().expect("key() on an invalid iterator");
        framed_internal_key(entry)
    }

    fn value(&self) -> &[u8] {
        let entry = self.inner.current().expect("value() on an invalid iterator");
        let (_, rest) = decode_length_prefixed(entry).expect("memtable entries are well-framed");
        let (value, _) = decode_length_prefixed(rest).expect("memtable entries are well-framed");
        value
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use silt_sstable::BytewiseComparator;
    use super::*;

    fn memtable() -> Memtable {
        Memtable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    #[test]
    fn newest_visible_version_wins() {
        let mem = memtable();
        mem.add(SequenceNumber(1), ValueType::Value, b"k", b"one");
        mem.add(SequenceNumber(5), ValueType::Value, b"k", b"five");
        mem.add(SequenceNumber(9), ValueType::Value, b"k", b"nine");

        let at = |seq| mem.get(&LookupKey::new(b"k", SequenceNumber(seq)));
        assert_eq!(at(9), Some(Some(b"nine".to_vec())));
        assert_eq!(at(100), Some(Some(b"nine".to_vec())));
        assert_eq!(at(7), Some(Some(b"five".to_vec())));
        assert_eq!(at(1), Some(Some(b"one".to_vec())));
        assert_eq!(at(0), None);
    }

    #[test]
    fn deletion_shadows_value() {
        let mem = memtable();
        mem.add(SequenceNumber(1), ValueType::Value, b"k", b"v");
        mem.add(SequenceNumber(2), ValueType::Deletion, b"k", b"");

        assert_eq!(mem.get(&LookupKey::new(b"k", SequenceNumber(3))), Some(None));
        assert_eq!(
            mem.get(&LookupKey::new(b"k", SequenceNumber(1))),
            Some(Some(b"v".to_vec())),
        );
    }

    #[test]
    fn unrelated_keys_are_invisible() {
        let mem = memtable();
        mem.add(SequenceNumber(1), ValueType::Value, b"aaa", b"1");
        assert_eq!(mem.get(&LookupKey::new(b"aab", SequenceNumber(5))), None);
        assert_eq!(mem.get(&LookupKey::new(b"aa", SequenceNumber(5))), None);
    }

    #[test]
    fn iterator_sees_internal_key_order() {
        let mem = memtable();
        mem.add(SequenceNumber(10), ValueType::Value, b"b", b"b10");
        mem.add(SequenceNumber(20), ValueType::Value, b"a", b"a20");
        mem.add(SequenceNumber(30), ValueType::Value, b"a", b"a30");

        let mut iter = mem.iter();
        iter.seek_to_first();

        // "a" newest first, then "b".
        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = ParsedInternalKey::decode(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.sequence.0));
            iter.next();
        }
        assert_eq!(seen, vec![
            (b"a".to_vec(), 30),
            (b"a".to_vec(), 20),
            (b"b".to_vec(), 10),
        ]);

        // Seek to (a, seq 25) lands on the 20 entry.
        let lookup = LookupKey::new(b"a", SequenceNumber(25));
        iter.seek(lookup.internal_key());
        assert!(iter.valid());
        assert_eq!(iter.value(), b"a20");

        iter.seek_to_last();
        assert_eq!(iter.value(), b"b10");
        iter.prev();
        assert_eq!(iter.value(), b"a20");
    }

    #[test]
    fn memory_usage_grows() {
        let mem = memtable();
        let before = mem.approximate_memory_usage();
        for i in 0..100_u32 {
            mem.add(
                SequenceNumber(u64::from(i) + 1),
                ValueType::Value,
                format!("key{i}").as_bytes(),
                &vec![b'v'; 100],
            );
        }
        assert!(mem.approximate_memory_usage() > before);
    }
}
