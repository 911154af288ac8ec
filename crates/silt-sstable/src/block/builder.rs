use integer_encoding::VarIntWriter as _;

use crate::comparator::common_prefix_len;
use super::U32_LEN;


/// Builds the byte representation of a [`Block`].
///
/// Keys must be added in strictly increasing order under the comparator that
/// will later be used to read the block; the builder trusts its caller and
/// does not check.
///
/// [`Block`]: super::Block
#[derive(Debug)]
pub struct BlockBuilder {
    buffer:           Vec<u8>,
    restarts:         Vec<u32>,
    last_key:         Vec<u8>,
    num_entries:      usize,
    restart_interval: usize,
    /// Entries added since the last restart point.
    restart_counter:  usize,
}

impl BlockBuilder {
    /// # Panics
    /// Panics if `restart_interval` is zero.
    #[must_use]
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval > 0, "restart interval must be at least 1");
        Self {
            buffer:           Vec::new(),
            restarts:         Vec::new(),
            last_key:         Vec::new(),
            num_entries:      0,
            restart_interval,
            restart_counter:  0,
        }
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// The last key added, unshortened.
    #[must_use]
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// The exact length [`BlockBuilder::finish`] would currently return.
    #[must_use]
    pub fn bytes_estimate(&self) -> usize {
        self.buffer.len() + U32_LEN * (self.restarts.len() + 1)
    }

    /// Add an entry. `key` must be strictly greater than every key added
    /// since the last [`reset`].
    ///
    /// [`reset`]: BlockBuilder::reset
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(
            self.num_entries == 0 || key > self.last_key.as_slice(),
            "keys must be added in strictly increasing order",
        );

        let shared = if self.restart_counter % self.restart_interval == 0 {
            self.restarts
                .push(u32::try_from(self.buffer.len()).expect("block exceeds 4 GiB"));
            self.restart_counter = 0;
            0
        } else {
            common_prefix_len(&self.last_key, key)
        };
        self.restart_counter += 1;

        let non_shared = &key[shared..];

        self.buffer.write_varint(shared as u32).expect("writing to a Vec cannot fail");
        self.buffer
            .write_varint(non_shared.len() as u32)
            .expect("writing to a Vec cannot fail");
        self.buffer
            .write_varint(value.len() as u32)
            .expect("writing to a Vec cannot fail");
        self.buffer.extend_from_slice(non_shared);
        self.buffer.extend_from_slice(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(non_shared);
        self.num_entries += 1;
    }

    /// Append the restart array and return the finished block bytes.
    ///
    /// Only [`reset`] may be called afterwards.
    ///
    /// [`reset`]: BlockBuilder::reset
    pub fn finish(&mut self) -> &[u8] {
        for restart in &self.restarts {
            self.buffer.extend_from_slice(&restart.to_le_bytes());
        }
        let num_restarts = u32::try_from(self.restarts.len()).expect("block exceeds 4 GiB");
        self.buffer.extend_from_slice(&num_restarts.to_le_bytes());
        &self.buffer
    }

    /// Make the builder ready for a new block, keeping buffer capacity.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.last_key.clear();
        self.num_entries = 0;
        self.restart_counter = 0;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_every_interval_entries() {
        let mut builder = BlockBuilder::new(2);
        builder.add(b"a", b"1");
        builder.add(b"b", b"2");
        builder.add(b"c", b"3");

        let finished = builder.finish().to_vec();
        let num_restarts =
            u32::from_le_bytes(finished[finished.len() - 4..].try_into().unwrap());
        assert_eq!(num_restarts, 2);
    }

    #[test]
    fn bytes_estimate_matches_finish() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"apple", b"red");
        builder.add(b"apricot", b"orange");
        let estimate = builder.bytes_estimate();
        assert_eq!(builder.finish().len(), estimate);
    }

    #[test]
    fn reset_clears_state() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"k", b"v");
        let _ = builder.finish();
        builder.reset();
        assert!(builder.is_empty());
        assert_eq!(builder.last_key(), b"");
        let empty = builder.finish();
        assert_eq!(empty.len(), 4);
    }
}
