//! The user-facing iterator: collapses the internal-key stream (versions,
//! deletions) to one entry per live user key, at a fixed sequence.

use std::cmp::Ordering;
use std::sync::Arc;

use oorandom::Rand64;

use silt_sstable::Comparator;

use crate::config::READ_BYTES_PERIOD;
use crate::error::{Error, Result};
use crate::format::{
    ParsedInternalKey, SequenceNumber, VALUE_TYPE_FOR_SEEK, ValueType, extract_user_key,
    pack_tag,
};
use crate::iter::InternalIterator;


/// Which way the iterator last moved; the underlying iterator's position
/// relative to the exposed entry differs per direction (see the fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The underlying iterator rests exactly on the exposed entry.
    Forward,
    /// The underlying iterator rests just *before* every entry for the
    /// exposed user key; `saved_key`/`saved_value` hold the exposed pair.
    Reverse,
}

/// An ordered cursor over the database's user keys at a fixed sequence.
/// Created by [`Db::iter`](crate::Db::iter).
///
/// Starts unpositioned; call [`seek_to_first`], [`seek_to_last`], or
/// [`seek`] before reading.
///
/// [`seek`]: DbIterator::seek
/// [`seek_to_first`]: DbIterator::seek_to_first
/// [`seek_to_last`]: DbIterator::seek_to_last
pub struct DbIterator {
    inner:     Box<dyn InternalIterator>,
    user_cmp:  Arc<dyn Comparator>,
    sequence:  SequenceNumber,

    direction: Direction,
    valid:     bool,
    /// Forward: scratch for the user key being skipped. Reverse: the key of
    /// the exposed entry.
    saved_key:   Vec<u8>,
    saved_value: Vec<u8>,
    status:      Option<Error>,

    /// Read sampling: after roughly [`READ_BYTES_PERIOD`] bytes pass under
    /// the cursor, the current key is reported back to the engine, which may
    /// charge a seek against an overlapping table file.
    sampler:              Box<dyn FnMut(&[u8]) + Send>,
    rng:                  Rand64,
    bytes_until_sampling: u64,
}

/// Parse the underlying iterator's current key, doing byte-count read
/// sampling on the way and latching (not propagating) corruption.
///
/// A macro rather than a method so the call sites keep field-disjoint
/// borrows: the parsed key borrows `inner` while `saved_key` and friends are
/// still writable.
macro_rules! parse_current_key {
    ($iter:expr) => {{
        let entry_key = $iter.inner.key();
        let key_len = entry_key.len() as u64;
        if $iter.bytes_until_sampling <= key_len {
            $iter.bytes_until_sampling = random_sampling_period(&mut $iter.rng);
            ($iter.sampler)(entry_key);
        } else {
            $iter.bytes_until_sampling -= key_len;
        }

        match ParsedInternalKey::decode(entry_key) {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                if $iter.status.is_none() {
                    $iter.status =
                        Some(Error::corruption("malformed internal key under iterator"));
                }
                None
            }
        }
    }};
}

impl DbIterator {
    pub(crate) fn new(
        inner:    Box<dyn InternalIterator>,
        user_cmp: Arc<dyn Comparator>,
        sequence: SequenceNumber,
        sampler:  Box<dyn FnMut(&[u8]) + Send>,
        seed:     u64,
    ) -> Self {
        let mut rng = Rand64::new(u128::from(seed));
        let bytes_until_sampling = random_sampling_period(&mut rng);
        Self {
            inner,
            user_cmp,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: None,
            sampler,
            rng,
            bytes_until_sampling,
        }
    }

    /// Whether the iterator currently rests on an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current user key.
    ///
    /// # Panics
    /// Panics if the iterator is not `valid()`.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        assert!(self.valid, "key() on an invalid iterator");
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// The current value.
    ///
    /// # Panics
    /// Panics if the iterator is not `valid()`.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        assert!(self.valid, "value() on an invalid iterator");
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// The first error the iterator ran into, if any. An iterator that went
    /// invalid without an error simply reached one end.
    pub fn status(&self) -> Result<()> {
        if let Some(err) = &self.status {
            return Err(err.clone());
        }
        self.inner.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Position on the first entry with user key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();

        // The newest visible version of `target` sorts first among its
        // entries; seek the internal stream there.
        let mut seek_key = Vec::with_capacity(target.len() + 8);
        seek_key.extend_from_slice(target);
        seek_key.extend_from_slice(&pack_tag(self.sequence, VALUE_TYPE_FOR_SEEK).to_le_bytes());
        self.inner.seek(&seek_key);

        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Advance to the next user key.
    ///
    /// # Panics
    /// Panics if the iterator is not `valid()`.
    pub fn next(&mut self) {
        assert!(self.valid, "next() on an invalid iterator");

        if self.direction == Direction::Reverse {
            // The underlying iterator sits before the current key's entries;
            // `saved_key` already holds the key to step past.
            self.direction = Direction::Forward;
            if self.inner.valid() {
                self.inner.next();
            } else {
                self.inner.seek_to_first();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            // Remember the key being left so its older versions are skipped.
            let user_key = extract_user_key(self.inner.key());
            self.saved_key.clear();
            self.saved_key.extend_from_slice(user_key);

            self.inner.next();
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    /// Step back to the previous user key.
    ///
    /// # Panics
    /// Panics if the iterator is not `valid()`.
    pub fn prev(&mut self) {
        assert!(self.valid, "prev() on an invalid iterator");

        if self.direction == Direction::Forward {
            // Back the underlying iterator off to just before the entries of
            // the current user key.
            let user_key = extract_user_key(self.inner.key());
            self.saved_key.clear();
            self.saved_key.extend_from_slice(user_key);
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                let user_key = extract_user_key(self.inner.key());
                if self.user_cmp.cmp(user_key, &self.saved_key) == Ordering::Less {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// Forward scan for the first visible, undeleted entry. While
    /// `skipping`, entries whose user key is at or before `saved_key` are
    /// older versions of an emitted (or deleted) key and are passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);
        debug_assert!(self.inner.valid());

        loop {
            if let Some(parsed) = parse_current_key!(self) {
                if parsed.sequence <= self.sequence {
                    match parsed.value_type {
                        ValueType::Deletion => {
                            // Older entries for this key are shadowed.
                            let user_key = parsed.user_key;
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(user_key);
                            skipping = true;
                        }
                        ValueType::Value => {
                            let hidden = skipping
                                && self.user_cmp.cmp(parsed.user_key, &self.saved_key)
                                    != Ordering::Greater;
                            if !hidden {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }
            self.inner.next();
            if !self.inner.valid() {
                break;
            }
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Backward scan: accumulate the newest visible entry of each user key
    /// until the key changes, then expose what was accumulated (unless it
    /// was a deletion).
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        while self.inner.valid() {
            if let Some(parsed) = parse_current_key!(self) {
                if parsed.sequence <= self.sequence {
                    if value_type != ValueType::Deletion
                        && self.user_cmp.cmp(parsed.user_key, &self.saved_key) == Ordering::Less
                    {
                        // Crossed into an earlier user key; the saved entry
                        // is the answer.
                        break;
                    }
                    value_type = parsed.value_type;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        let user_key = parsed.user_key;
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(user_key);
                        self.saved_value.clear();
                        let value = self.inner.value();
                        self.saved_value.extend_from_slice(value);
                    }
                }
            }
            self.inner.prev();
        }

        if value_type == ValueType::Deletion {
            // Ran off the front.
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

/// Uniform over `0..2 * READ_BYTES_PERIOD`, averaging one sample per MiB.
fn random_sampling_period(rng: &mut Rand64) -> u64 {
    rng.rand_range(0..2 * READ_BYTES_PERIOD)
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("valid", &self.valid)
            .field("direction", &self.direction)
            .field("sequence", &self.sequence.0)
            .finish_non_exhaustive()
    }
}
