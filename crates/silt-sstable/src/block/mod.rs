//! Immutable prefix-compressed key/value blocks.
//!
//! A block is `entries || restart_offsets[u32 LE] x num_restarts ||
//! num_restarts[u32 LE]`. Each entry holds three varint32s - `shared`,
//! `non_shared`, `value_len` - followed by `non_shared` key-suffix bytes and
//! the value bytes. At every restart offset, `shared == 0`, so iteration can
//! begin there without history; between restarts keys share prefixes with
//! their predecessor.

mod builder;
mod iter;

pub use self::builder::BlockBuilder;
pub use self::iter::BlockIter;

use crate::error::{TableError, TableResult};


pub(crate) const U32_LEN: usize = size_of::<u32>();

/// A parsed, immutable block: the raw bytes plus the decoded restart-array
/// geometry. Shared between iterators (and the block cache) via `Arc`.
#[derive(Debug)]
pub struct Block {
    contents:        Vec<u8>,
    /// Offset where entry data ends and the restart array begins.
    restarts_offset: usize,
    num_restarts:    usize,
}

impl Block {
    /// Wrap block bytes, validating only the restart-array geometry. Entry
    /// bytes are validated lazily as iterators parse them.
    pub fn new(contents: Vec<u8>) -> TableResult<Self> {
        if contents.len() < U32_LEN {
            return Err(TableError::corruption("block too short for restart count"));
        }

        let num_restarts =
            u32::from_le_bytes(contents[contents.len() - U32_LEN..].try_into().expect("4 bytes"));
        let num_restarts = num_restarts as usize;

        let restart_array_len = (num_restarts + 1)
            .checked_mul(U32_LEN)
            .ok_or_else(|| TableError::corruption("block restart count overflows"))?;
        let restarts_offset = contents
            .len()
            .checked_sub(restart_array_len)
            .ok_or_else(|| TableError::corruption("block restart array out of range"))?;

        Ok(Self {
            contents,
            restarts_offset,
            num_restarts,
        })
    }

    /// The raw block bytes, including the restart array.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// The block's in-memory charge for cache accounting.
    #[must_use]
    pub fn charge(&self) -> usize {
        self.contents.len()
    }

    #[must_use]
    pub(crate) fn num_restarts(&self) -> usize {
        self.num_restarts
    }

    #[must_use]
    pub(crate) fn restarts_offset(&self) -> usize {
        self.restarts_offset
    }

    /// The entry offset stored in restart slot `index`.
    ///
    /// # Panics
    /// Panics if `index >= self.num_restarts()`.
    #[must_use]
    pub(crate) fn restart_point(&self, index: usize) -> usize {
        assert!(index < self.num_restarts, "restart index out of range");
        let at = self.restarts_offset + U32_LEN * index;
        let offset = u32::from_le_bytes(self.contents[at..at + U32_LEN].try_into().expect("4 bytes"));
        offset as usize
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::comparator::BytewiseComparator;
    use super::*;

    fn build(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::new(builder.finish().to_vec()).unwrap())
    }

    fn cmp() -> Arc<BytewiseComparator> {
        Arc::new(BytewiseComparator)
    }

    #[test]
    fn empty_block_round_trips() {
        let block = build(&[], 16);
        let mut iter = BlockIter::new(block, cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn entries_come_back_in_insertion_order() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100_u32)
            .map(|i| (format!("key{i:05}").into_bytes(), format!("value{i}").into_bytes()))
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();

        for restart_interval in [1, 2, 16, 128] {
            let block = build(&borrowed, restart_interval);
            let mut iter = BlockIter::new(Arc::clone(&block), cmp());

            iter.seek_to_first();
            for (key, value) in &entries {
                assert!(iter.valid());
                assert_eq!(iter.key(), key.as_slice());
                assert_eq!(iter.value(), value.as_slice());
                iter.next();
            }
            assert!(!iter.valid());
        }
    }

    #[test]
    fn seek_lands_on_lower_bound() {
        let block = build(&[(b"apple", b"1"), (b"banana", b"2"), (b"cherry", b"3")], 2);
        let mut iter = BlockIter::new(block, cmp());

        iter.seek(b"banana");
        assert_eq!(iter.key(), b"banana");

        iter.seek(b"apricot");
        assert_eq!(iter.key(), b"banana");

        iter.seek(b"");
        assert_eq!(iter.key(), b"apple");

        iter.seek(b"zebra");
        assert!(!iter.valid());
    }

    #[test]
    fn prev_walks_backwards_across_restarts() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..40_u32)
            .map(|i| (format!("k{i:03}").into_bytes(), format!("v{i}").into_bytes()))
            .collect();
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build(&borrowed, 3);
        let mut iter = BlockIter::new(block, cmp());

        iter.seek_to_last();
        for (key, _) in entries.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_slice());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn shared_prefix_reconstruction() {
        let block = build(
            &[
                (b"prefix_aaa", b"1"),
                (b"prefix_aab", b"2"),
                (b"prefix_abc", b"3"),
                (b"prefix_b", b"4"),
            ],
            16,
        );
        let mut iter = BlockIter::new(block, cmp());
        iter.seek(b"prefix_abc");
        assert_eq!(iter.key(), b"prefix_abc");
        assert_eq!(iter.value(), b"3");
    }

    #[test]
    fn malformed_varint_reports_corruption() {
        // A lone 0xff is an unterminated varint; follow it with a plausible
        // restart array claiming one restart at offset zero.
        let mut contents = vec![0xff_u8];
        contents.extend_from_slice(&0_u32.to_le_bytes());
        contents.extend_from_slice(&1_u32.to_le_bytes());

        let block = Arc::new(Block::new(contents).unwrap());
        let mut iter = BlockIter::new(block, cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(matches!(iter.status(), Err(TableError::Corruption(_))));
    }

    #[test]
    fn oversized_shared_len_reports_corruption() {
        // First entry claims to share 5 bytes with a nonexistent predecessor.
        let mut contents = Vec::new();
        contents.push(5_u8); // shared
        contents.push(1_u8); // non_shared
        contents.push(0_u8); // value_len
        contents.push(b'x');
        contents.extend_from_slice(&0_u32.to_le_bytes());
        contents.extend_from_slice(&1_u32.to_le_bytes());

        let block = Arc::new(Block::new(contents).unwrap());
        let mut iter = BlockIter::new(block, cmp());
        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(matches!(iter.status(), Err(TableError::Corruption(_))));
    }
}
