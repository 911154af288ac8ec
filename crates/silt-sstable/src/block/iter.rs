use std::cmp::Ordering;
use std::sync::Arc;

use integer_encoding::VarInt as _;

use crate::comparator::Comparator;
use crate::error::{TableError, TableResult};
use super::Block;


/// A cursor over the entries of a [`Block`].
///
/// Starts at the not-`valid()` position; position it with one of the seek
/// methods. On corrupt block bytes the iterator becomes invalid and the
/// corruption is reported through [`BlockIter::status`].
pub struct BlockIter {
    block:          Arc<Block>,
    cmp:            Arc<dyn Comparator>,

    /// Offset of the entry the iterator rests on. Meaningful only when
    /// `valid`.
    current_offset: usize,
    /// Offset one past the current entry's value bytes; where the next entry
    /// would be parsed.
    next_offset:    usize,
    /// The current entry's key, reconstructed across shared prefixes.
    key:            Vec<u8>,
    /// Byte range of the current entry's value inside the block.
    value_range:    (usize, usize),

    valid:          bool,
    /// First corruption seen, as a message; sticky until the next seek.
    corruption:     Option<String>,
}

impl BlockIter {
    #[must_use]
    pub fn new(block: Arc<Block>, cmp: Arc<dyn Comparator>) -> Self {
        Self {
            block,
            cmp,
            current_offset: 0,
            next_offset:    0,
            key:            Vec::new(),
            value_range:    (0, 0),
            valid:          false,
            corruption:     None,
        }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn status(&self) -> TableResult<()> {
        match &self.corruption {
            Some(message) => Err(TableError::corruption(message.clone())),
            None          => Ok(()),
        }
    }

    /// # Panics
    /// Panics if the iterator is not `valid()`.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        assert!(self.valid, "key() on an invalid block iterator");
        &self.key
    }

    /// # Panics
    /// Panics if the iterator is not `valid()`.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        assert!(self.valid, "value() on an invalid block iterator");
        &self.block.contents()[self.value_range.0..self.value_range.1]
    }

    pub fn seek_to_first(&mut self) {
        self.corruption = None;
        if self.block.num_restarts() == 0 {
            self.valid = false;
            return;
        }
        self.position_at_restart(0);
        self.parse_current(false);
    }

    pub fn seek_to_last(&mut self) {
        self.corruption = None;
        let num_restarts = self.block.num_restarts();
        if num_restarts == 0 {
            self.valid = false;
            return;
        }

        self.position_at_restart(num_restarts - 1);
        if !self.parse_current(false) {
            return;
        }
        while self.next_offset < self.block.restarts_offset() {
            if !self.parse_current(true) {
                return;
            }
        }
    }

    /// Position on the first entry whose key is `>= target`; invalid if every
    /// key is smaller.
    pub fn seek(&mut self, target: &[u8]) {
        self.corruption = None;
        let num_restarts = self.block.num_restarts();
        if num_restarts == 0 {
            self.valid = false;
            return;
        }

        // Binary search: the greatest restart whose first key is < target.
        // Restart 0 is used even if its key is >= target, since the linear
        // scan below only moves forward.
        let mut left = 0_usize;
        let mut right = num_restarts - 1;
        while left < right {
            let middle = (left + right + 1) / 2;
            self.position_at_restart(middle);
            if !self.parse_current(false) {
                return;
            }
            if self.cmp.cmp(&self.key, target) == Ordering::Less {
                left = middle;
            } else {
                right = middle - 1;
            }
        }

        self.position_at_restart(left);
        loop {
            if !self.parse_current(false) {
                return;
            }
            if self.cmp.cmp(&self.key, target) != Ordering::Less {
                return;
            }
            if self.next_offset >= self.block.restarts_offset() {
                self.valid = false;
                return;
            }
        }
    }

    /// Advance to the next entry; past the last entry the iterator becomes
    /// invalid.
    ///
    /// # Panics
    /// Panics if the iterator is not `valid()`.
    pub fn next(&mut self) {
        assert!(self.valid, "next() on an invalid block iterator");
        if self.next_offset >= self.block.restarts_offset() {
            self.valid = false;
            return;
        }
        self.parse_current(true);
    }

    /// Step to the previous entry; before the first entry the iterator
    /// becomes invalid.
    ///
    /// # Panics
    /// Panics if the iterator is not `valid()`.
    pub fn prev(&mut self) {
        assert!(self.valid, "prev() on an invalid block iterator");
        let original = self.current_offset;

        // The greatest restart strictly before the current entry; if the
        // current entry is the first restart's entry, there is no previous.
        if self.block.restart_point(0) >= original {
            self.valid = false;
            return;
        }
        let mut left = 0_usize;
        let mut right = self.block.num_restarts() - 1;
        while left < right {
            let middle = (left + right + 1) / 2;
            if self.block.restart_point(middle) < original {
                left = middle;
            } else {
                right = middle - 1;
            }
        }

        self.position_at_restart(left);
        if !self.parse_current(false) {
            return;
        }
        while self.next_offset < original {
            if !self.parse_current(true) {
                return;
            }
        }
    }

    fn position_at_restart(&mut self, restart_index: usize) {
        self.key.clear();
        self.valid = false;
        self.next_offset = self.block.restart_point(restart_index);
    }

    /// Parse the entry at `self.next_offset` and make it current. Returns
    /// whether the iterator is valid afterwards.
    ///
    /// `sequential` indicates the previous entry's key is still in
    /// `self.key`, enabling the key-order corruption check.
    fn parse_current(&mut self, sequential: bool) -> bool {
        let data = self.block.contents();
        let limit = self.block.restarts_offset();
        let offset = self.next_offset;

        if offset >= limit {
            return self.corrupt("entry offset beyond restart array");
        }

        let mut position = offset;
        let mut header = [0_usize; 3];
        for field in &mut header {
            let Some((decoded, varint_len)) = u32::decode_var(&data[position..limit]) else {
                return self.corrupt("bad entry header varint");
            };
            *field = decoded as usize;
            position += varint_len;
        }
        let [shared, non_shared, value_len] = header;

        if shared > self.key.len() {
            return self.corrupt("entry shares more bytes than the previous key has");
        }
        let key_start = position;
        let value_start = key_start + non_shared;
        let value_end = value_start + value_len;
        if value_end > limit {
            return self.corrupt("entry extends past the end of the block");
        }

        let key_delta = &data[key_start..value_start];

        if sequential && self.valid {
            // Cheap order check without copying the previous key: compare at
            // the first position where the new key may differ from the old.
            let backwards = if shared < self.key.len() {
                key_delta.first().is_none_or(|&next_byte| next_byte < self.key[shared])
            } else {
                // The old key is a prefix of the new one; equal keys (empty
                // delta) are also out of order.
                key_delta.is_empty()
            };
            if backwards {
                return self.corrupt("keys out of order within a block");
            }
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(key_delta);
        self.value_range = (value_start, value_end);
        self.current_offset = offset;
        self.next_offset = value_end;
        self.valid = true;
        true
    }

    fn corrupt(&mut self, message: &str) -> bool {
        if self.corruption.is_none() {
            self.corruption = Some(format!("block: {message}"));
        }
        self.valid = false;
        false
    }
}

impl std::fmt::Debug for BlockIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIter")
            .field("valid", &self.valid)
            .field("current_offset", &self.current_offset)
            .field("corruption", &self.corruption)
            .finish_non_exhaustive()
    }
}
