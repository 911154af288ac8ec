//! Filter blocks: one filter per 2 KiB span of data-block starting offsets.
//!
//! Layout: all filters concatenated, then one u32 LE offset per filter, then
//! a u32 LE giving where the offset array starts, then one byte holding
//! `base_lg`. A data block starting at file offset `o` is covered by filter
//! `o >> base_lg`.

use std::sync::Arc;

use crate::filter::FilterPolicy;


/// Filters cover 2 KiB spans of data-block start offsets.
const FILTER_BASE_LG: u8 = 11;
/// Offset-array start (4 bytes) plus `base_lg` (1 byte).
const TRAILER_LEN: usize = 5;

/// Accumulates the filter block for a table being built.
///
/// Call order: `start_block(offset)` before each data block is written, then
/// `add_key` for each of its keys, and `finish` once. Keys and blocks must
/// arrive in file order.
#[derive(Debug)]
pub struct FilterBlockBuilder {
    policy:         Arc<dyn FilterPolicy>,
    /// All filters generated so far, concatenated.
    filters:        Vec<u8>,
    filter_offsets: Vec<u32>,
    /// Keys of the pending span, flattened, with their start indices.
    pending_keys:   Vec<u8>,
    pending_starts: Vec<usize>,
}

impl FilterBlockBuilder {
    #[must_use]
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            filters:        Vec::new(),
            filter_offsets: Vec::new(),
            pending_keys:   Vec::new(),
            pending_starts: Vec::new(),
        }
    }

    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Note that the next data block begins at file offset `block_offset`.
    ///
    /// Offsets must be non-decreasing across calls.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset >> FILTER_BASE_LG;
        // The first iteration flushes the pending span; the rest emit empty
        // filters for 2 KiB spans no block started in.
        while (self.filter_offsets.len() as u64) < filter_index {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.pending_starts.push(self.pending_keys.len());
        self.pending_keys.extend_from_slice(key);
    }

    /// The length `finish` would currently produce.
    #[must_use]
    pub fn bytes_estimate(&self) -> usize {
        self.filters.len() + self.filter_offsets.len() * 4 + TRAILER_LEN
    }

    /// Produce the complete filter block.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        if !self.pending_starts.is_empty() {
            self.generate_filter();
        }

        let offsets_start = u32::try_from(self.filters.len()).expect("filter block exceeds 4 GiB");
        let mut block = self.filters;
        for offset in &self.filter_offsets {
            block.extend_from_slice(&offset.to_le_bytes());
        }
        block.extend_from_slice(&offsets_start.to_le_bytes());
        block.push(FILTER_BASE_LG);
        block
    }

    fn generate_filter(&mut self) {
        self.filter_offsets
            .push(u32::try_from(self.filters.len()).expect("filter block exceeds 4 GiB"));
        if self.pending_starts.is_empty() {
            // An empty filter: its offset equals the next filter's offset.
            return;
        }

        self.policy
            .create_filter(&self.pending_keys, &self.pending_starts, &mut self.filters);
        self.pending_keys.clear();
        self.pending_starts.clear();
    }
}

/// Queries a filter block read from a table.
#[derive(Debug)]
pub struct FilterBlockReader {
    policy:        Arc<dyn FilterPolicy>,
    block:         Vec<u8>,
    offsets_start: usize,
    num_filters:   usize,
    base_lg:       u8,
}

impl FilterBlockReader {
    /// Returns `None` if the block bytes are not a plausible filter block;
    /// filters are an optimization, so callers treat that as "no filter"
    /// rather than an error.
    #[must_use]
    pub fn new(policy: Arc<dyn FilterPolicy>, block: Vec<u8>) -> Option<Self> {
        if block.len() < TRAILER_LEN {
            return None;
        }

        let base_lg = block[block.len() - 1];
        let offsets_start = u32::from_le_bytes(
            block[block.len() - TRAILER_LEN..block.len() - 1]
                .try_into()
                .expect("4 bytes"),
        ) as usize;
        if offsets_start > block.len() - TRAILER_LEN {
            return None;
        }

        let num_filters = (block.len() - TRAILER_LEN - offsets_start) / 4;
        Some(Self {
            policy,
            block,
            offsets_start,
            num_filters,
            base_lg,
        })
    }

    /// Whether `key` may be present in the data block starting at file offset
    /// `block_offset`.
    #[must_use]
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let filter_index = block_offset >> self.base_lg;
        let Ok(filter_index) = usize::try_from(filter_index) else {
            return true;
        };
        if filter_index >= self.num_filters {
            // Out of range counts as a possible match; the lookup proceeds to
            // the data block.
            return true;
        }

        let start = self.filter_offset(filter_index);
        let end = if filter_index + 1 < self.num_filters {
            self.filter_offset(filter_index + 1)
        } else {
            self.offsets_start
        };
        if start > end || end > self.offsets_start {
            return true;
        }

        let filter = &self.block[start..end];
        if filter.is_empty() {
            // An empty filter covers no keys at all.
            return false;
        }
        self.policy.key_may_match(key, filter)
    }

    fn filter_offset(&self, index: usize) -> usize {
        let at = self.offsets_start + 4 * index;
        u32::from_le_bytes(self.block[at..at + 4].try_into().expect("4 bytes")) as usize
    }
}


#[cfg(test)]
mod tests {
    use crate::filter::BloomFilterPolicy;
    use super::*;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::default())
    }

    #[test]
    fn empty_builder_produces_trailer_only() {
        let builder = FilterBlockBuilder::new(policy());
        let block = builder.finish();
        assert_eq!(block.len(), TRAILER_LEN);
        assert_eq!(block[block.len() - 1], FILTER_BASE_LG);

        let reader = FilterBlockReader::new(policy(), block).unwrap();
        // No filters at all: everything may match.
        assert!(reader.key_may_match(0, b"foo"));
    }

    #[test]
    fn single_span_filters_its_keys() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        let block = builder.finish();

        let reader = FilterBlockReader::new(policy(), block).unwrap();
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(!reader.key_may_match(0, b"definitely-absent-key"));
    }

    #[test]
    fn spans_partition_by_block_offset() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"alpha");
        // 9000 >> 11 == 4: three empty filters in between.
        builder.start_block(9000);
        builder.add_key(b"omega");
        let block = builder.finish();

        let reader = FilterBlockReader::new(policy(), block).unwrap();
        assert!(reader.key_may_match(0, b"alpha"));
        assert!(reader.key_may_match(9000, b"omega"));
        // The empty middle spans match nothing.
        assert!(!reader.key_may_match(4100, b"alpha"));
        // And alpha is not in omega's span.
        assert!(!reader.key_may_match(9000, b"alpha"));
    }

    #[test]
    fn truncated_block_is_rejected_not_fatal() {
        assert!(FilterBlockReader::new(policy(), vec![0, 1]).is_none());
    }
}
