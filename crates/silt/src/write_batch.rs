//! Atomic groups of updates.
//!
//! A batch is a single byte buffer, which is also exactly what gets appended
//! to the write-ahead log: an 8-byte little-endian starting sequence, a
//! 4-byte little-endian record count, then the records. Each record is a
//! type byte followed by a length-prefixed key and, for puts, a
//! length-prefixed value. All records in a batch commit or none do.

use integer_encoding::VarIntWriter as _;

use crate::error::{Error, Result};
use crate::format::{SequenceNumber, ValueType, decode_length_prefixed};


/// `sequence (8) || count (4)`.
const HEADER_LEN: usize = 12;

/// An ordered set of puts and deletes applied atomically by
/// [`Db::write`](crate::Db::write).
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rep: vec![0; HEADER_LEN],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        append_length_prefixed(&mut self.rep, key);
        append_length_prefixed(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        append_length_prefixed(&mut self.rep, key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_LEN, 0);
    }

    /// Number of records in the batch.
    #[must_use]
    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.rep[8..12].try_into().expect("4 bytes"))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Size in bytes of the serialized batch (the log record it becomes).
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.rep.len()
    }

    /// Append all of `other`'s records to `self`. Used by the write pipeline
    /// to fold follower batches into the leader's.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_LEN..]);
    }

    /// Iterate the records. Each item is a [`BatchEntry`]; malformed bytes
    /// yield a corruption error and end iteration.
    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            rest:      &self.rep[HEADER_LEN..],
            remaining: self.count(),
            poisoned:  false,
        }
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        SequenceNumber(u64::from_le_bytes(self.rep[..8].try_into().expect("8 bytes")))
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.0.to_le_bytes());
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// The serialized form, as appended to the write-ahead log.
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Reconstruct a batch from a log record.
    pub(crate) fn from_contents(contents: &[u8]) -> Result<Self> {
        if contents.len() < HEADER_LEN {
            return Err(Error::corruption("log record smaller than a batch header"));
        }
        Ok(Self {
            rep: contents.to_vec(),
        })
    }
}

/// One record of a [`WriteBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEntry<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

/// Iterator over batch records. See [`WriteBatch::iter`].
#[derive(Debug)]
pub struct BatchIter<'a> {
    rest:      &'a [u8],
    remaining: u32,
    poisoned:  bool,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned {
            return None;
        }
        if self.remaining == 0 {
            if !self.rest.is_empty() {
                self.poisoned = true;
                return Some(Err(Error::corruption("write batch has trailing bytes")));
            }
            return None;
        }
        self.remaining -= 1;

        match self.parse_entry() {
            Ok(entry) => Some(Ok(entry)),
            Err(err) => {
                self.poisoned = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a> BatchIter<'a> {
    fn parse_entry(&mut self) -> Result<BatchEntry<'a>> {
        let (&tag, rest) = self
            .rest
            .split_first()
            .ok_or_else(|| Error::corruption("write batch record count overstates records"))?;

        match ValueType::from_tag_byte(tag)? {
            ValueType::Value => {
                let (key, rest) = decode_length_prefixed(rest)?;
                let (value, rest) = decode_length_prefixed(rest)?;
                self.rest = rest;
                Ok(BatchEntry::Put { key, value })
            }
            ValueType::Deletion => {
                let (key, rest) = decode_length_prefixed(rest)?;
                self.rest = rest;
                Ok(BatchEntry::Delete { key })
            }
        }
    }
}

fn append_length_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    out.write_varint(data.len() as u32).expect("writing to a Vec cannot fail");
    out.extend_from_slice(data);
}


#[cfg(test)]
mod tests {
    use super::*;

    fn entries(batch: &WriteBatch) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        batch
            .iter()
            .map(|entry| match entry.unwrap() {
                BatchEntry::Put { key, value } => (key.to_vec(), Some(value.to_vec())),
                BatchEntry::Delete { key } => (key.to_vec(), None),
            })
            .collect()
    }

    #[test]
    fn records_round_trip_in_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"", b"");
        assert_eq!(batch.count(), 3);

        assert_eq!(entries(&batch), vec![
            (b"a".to_vec(), Some(b"1".to_vec())),
            (b"b".to_vec(), None),
            (Vec::new(), Some(Vec::new())),
        ]);
    }

    #[test]
    fn sequence_is_stored_in_the_header() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        batch.set_sequence(SequenceNumber(0x00ab_cdef_0102_0304));
        assert_eq!(batch.sequence(), SequenceNumber(0x00ab_cdef_0102_0304));

        let reparsed = WriteBatch::from_contents(batch.contents()).unwrap();
        assert_eq!(reparsed.sequence(), batch.sequence());
        assert_eq!(reparsed.count(), 1);
    }

    #[test]
    fn append_merges_counts_and_records() {
        let mut leader = WriteBatch::new();
        leader.put(b"x", b"1");

        let mut follower = WriteBatch::new();
        follower.delete(b"y");
        follower.put(b"z", b"2");

        leader.append(&follower);
        assert_eq!(leader.count(), 3);
        assert_eq!(entries(&leader), vec![
            (b"x".to_vec(), Some(b"1".to_vec())),
            (b"y".to_vec(), None),
            (b"z".to_vec(), Some(b"2".to_vec())),
        ]);
    }

    #[test]
    fn clear_resets_to_an_empty_batch() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.byte_size(), 12);
    }

    #[test]
    fn truncated_record_is_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let mut bytes = batch.contents().to_vec();
        bytes.truncate(bytes.len() - 2);

        let reparsed = WriteBatch::from_contents(&bytes).unwrap();
        let result: Vec<_> = reparsed.iter().collect();
        assert_eq!(result.len(), 1);
        assert!(result[0].is_err());
    }
}
