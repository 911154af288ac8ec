//! Internal keys and their encodings.
//!
//! A user key is versioned by appending an 8-byte little-endian **tag**:
//! the sequence number in the upper 56 bits and the entry type in the low 8.
//! Internal keys order by user key ascending, then sequence *descending*,
//! then type descending, so the newest version of a user key is met first.

use std::cmp::Ordering;
use std::sync::Arc;

use integer_encoding::{VarInt as _, VarIntWriter as _};

use silt_sstable::Comparator;
use silt_sstable::filter::FilterPolicy;

use crate::error::{Error, Result};

pub(crate) use silt_sstable::format::{mask_checksum, unmask_checksum};


/// A monotonically increasing 56-bit version number; one is consumed per
/// record in a write batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self((1 << 56) - 1);

    #[must_use]
    pub(crate) fn add(self, count: u64) -> Self {
        debug_assert!(self.0 + count <= Self::MAX.0, "sequence numbers exhausted");
        Self(self.0 + count)
    }
}

/// What an internal entry means for its user key.
///
/// The discriminants are persisted; `Deletion < Value` so that within one
/// (user key, sequence), a value sorts before a deletion under the
/// descending-type order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0,
    Value    = 1,
}

/// The type used when constructing seek targets: the greatest type, so a
/// lookup key sorts before every entry with the same user key and sequence.
pub(crate) const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    pub(crate) fn from_tag_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Deletion),
            1 => Ok(Self::Value),
            other => Err(Error::corruption(format!("unknown value type {other}"))),
        }
    }
}

#[inline]
#[must_use]
pub(crate) fn pack_tag(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    (sequence.0 << 8) | u64::from(value_type as u8)
}

/// A parsed internal key, borrowing its user key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParsedInternalKey<'a> {
    pub user_key:   &'a [u8],
    pub sequence:   SequenceNumber,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub(crate) fn decode(internal_key: &'a [u8]) -> Result<Self> {
        let (user_key, tag) = split_internal_key(internal_key)?;
        let value_type = ValueType::from_tag_byte((tag & 0xff) as u8)?;
        Ok(Self {
            user_key,
            sequence: SequenceNumber(tag >> 8),
            value_type,
        })
    }

    pub(crate) fn append_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.user_key);
        out.extend_from_slice(&pack_tag(self.sequence, self.value_type).to_le_bytes());
    }

    #[must_use]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.user_key.len() + 8);
        self.append_to(&mut out);
        out
    }
}

/// Split an encoded internal key into (user key, tag).
pub(crate) fn split_internal_key(internal_key: &[u8]) -> Result<(&[u8], u64)> {
    let user_key_len = internal_key
        .len()
        .checked_sub(8)
        .ok_or_else(|| Error::corruption("internal key shorter than its tag"))?;
    let (user_key, tag_bytes) = internal_key.split_at(user_key_len);
    let tag = u64::from_le_bytes(tag_bytes.try_into().expect("8 bytes"));
    Ok((user_key, tag))
}

/// The user-key prefix of an encoded internal key.
///
/// Degrades to the whole slice for (corrupt) keys shorter than the tag, so
/// comparator paths stay panic-free on bad data; decoding proper reports the
/// corruption.
#[must_use]
pub(crate) fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    &internal_key[..internal_key.len().saturating_sub(8)]
}

/// A seek target for the memtable and tables: the internal key
/// `(user_key, sequence, VALUE_TYPE_FOR_SEEK)`, plus the same bytes in
/// memtable-entry framing (length-prefixed).
#[derive(Debug)]
pub(crate) struct LookupKey {
    /// `varint32(user_key.len() + 8) || user_key || tag`
    bytes:     Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    #[must_use]
    pub(crate) fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let internal_len = user_key.len() + 8;
        let mut bytes = Vec::with_capacity(internal_len + 5);
        bytes
            .write_varint(internal_len as u32)
            .expect("writing to a Vec cannot fail");
        let key_start = bytes.len();
        bytes.extend_from_slice(user_key);
        bytes.extend_from_slice(&pack_tag(sequence, VALUE_TYPE_FOR_SEEK).to_le_bytes());
        Self { bytes, key_start }
    }

    /// The framed form the memtable stores: length prefix plus internal key.
    #[must_use]
    pub(crate) fn memtable_key(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub(crate) fn internal_key(&self) -> &[u8] {
        &self.bytes[self.key_start..]
    }

    #[must_use]
    pub(crate) fn user_key(&self) -> &[u8] {
        &self.bytes[self.key_start..self.bytes.len() - 8]
    }
}

/// Orders internal keys: user key ascending under the wrapped comparator,
/// then tag (sequence, then type) descending.
#[derive(Debug, Clone)]
pub(crate) struct InternalKeyComparator {
    pub user_cmp: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    #[must_use]
    pub(crate) fn new(user_cmp: Arc<dyn Comparator>) -> Self {
        Self { user_cmp }
    }

    pub(crate) fn cmp_user(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user_cmp.cmp(a, b)
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "leveldb.InternalKeyComparator"
    }

    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a_user = extract_user_key(a);
        let b_user = extract_user_key(b);
        match self.user_cmp.cmp(a_user, b_user) {
            Ordering::Equal => {
                let a_tag = u64::from_le_bytes(a[a.len() - 8..].try_into().expect("8 bytes"));
                let b_tag = u64::from_le_bytes(b[b.len() - 8..].try_into().expect("8 bytes"));
                // Newer (greater tag) sorts first.
                b_tag.cmp(&a_tag)
            }
            unequal => unequal,
        }
    }

    fn find_short_separator(&self, from: &[u8], to: &[u8], separator: &mut Vec<u8>) {
        let from_user = extract_user_key(from);
        let to_user = extract_user_key(to);

        let mut user_separator = Vec::new();
        self.user_cmp
            .find_short_separator(from_user, to_user, &mut user_separator);

        if user_separator.len() < from_user.len()
            && self.user_cmp.cmp(from_user, &user_separator) == Ordering::Less
        {
            // The user key shrank; tag it with the maximum sequence so it
            // sorts before every real entry with that user key.
            separator.clear();
            separator.extend_from_slice(&user_separator);
            separator
                .extend_from_slice(&pack_tag(SequenceNumber::MAX, VALUE_TYPE_FOR_SEEK).to_le_bytes());
            debug_assert!(self.cmp(from, separator) == Ordering::Less);
            debug_assert!(self.cmp(separator, to) == Ordering::Less);
        } else {
            separator.clear();
            separator.extend_from_slice(from);
        }
    }

    fn find_short_successor(&self, key: &[u8], successor: &mut Vec<u8>) {
        let user_key = extract_user_key(key);

        let mut user_successor = Vec::new();
        self.user_cmp.find_short_successor(user_key, &mut user_successor);

        if user_successor.len() < user_key.len()
            && self.user_cmp.cmp(user_key, &user_successor) == Ordering::Less
        {
            successor.clear();
            successor.extend_from_slice(&user_successor);
            successor
                .extend_from_slice(&pack_tag(SequenceNumber::MAX, VALUE_TYPE_FOR_SEEK).to_le_bytes());
            debug_assert!(self.cmp(key, successor) == Ordering::Less);
        } else {
            successor.clear();
            successor.extend_from_slice(key);
        }
    }
}

/// Adapts a user-key filter policy to internal keys: filters are built over
/// and queried with the user-key prefix, so a lookup probes with the same
/// bytes the builder hashed.
#[derive(Debug)]
pub(crate) struct InternalFilterPolicy {
    pub user_policy: Arc<dyn FilterPolicy>,
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user_policy.name()
    }

    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>) {
        // Re-flatten with the 8-byte tags stripped.
        let mut user_keys = Vec::with_capacity(flattened_keys.len());
        let mut user_offsets = Vec::with_capacity(key_offsets.len());
        for (index, &start) in key_offsets.iter().enumerate() {
            let end = key_offsets
                .get(index + 1)
                .copied()
                .unwrap_or(flattened_keys.len());
            let internal_key = &flattened_keys[start..end];
            user_offsets.push(user_keys.len());
            user_keys.extend_from_slice(extract_user_key(internal_key));
        }
        self.user_policy.create_filter(&user_keys, &user_offsets, filter);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user_policy.key_may_match(extract_user_key(key), filter)
    }
}

/// An owned internal key, used in file metadata and version edits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct InternalKey(pub Vec<u8>);

impl InternalKey {
    #[must_use]
    pub(crate) fn new(
        user_key:   &[u8],
        sequence:   SequenceNumber,
        value_type: ValueType,
    ) -> Self {
        Self(
            ParsedInternalKey {
                user_key,
                sequence,
                value_type,
            }
            .encode(),
        )
    }

    #[must_use]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub(crate) fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }
}

/// Decode a `varint32` length-prefixed slice from the front of `input`,
/// returning the slice and the rest.
pub(crate) fn decode_length_prefixed(input: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, varint_len) = u32::decode_var(input)
        .ok_or_else(|| Error::corruption("bad length prefix"))?;
    let len = len as usize;
    let data = &input[varint_len..];
    if data.len() < len {
        return Err(Error::corruption("length prefix past end of input"));
    }
    Ok((&data[..len], &data[len..]))
}


#[cfg(test)]
mod tests {
    use silt_sstable::BytewiseComparator;
    use super::*;

    fn ikey(user_key: &[u8], sequence: u64, value_type: ValueType) -> Vec<u8> {
        InternalKey::new(user_key, SequenceNumber(sequence), value_type).0
    }

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn tag_round_trips() {
        let encoded = ikey(b"user", 0x1234_5678, ValueType::Value);
        let parsed = ParsedInternalKey::decode(&encoded).unwrap();
        assert_eq!(parsed.user_key, b"user");
        assert_eq!(parsed.sequence, SequenceNumber(0x1234_5678));
        assert_eq!(parsed.value_type, ValueType::Value);
    }

    #[test]
    fn order_is_user_asc_then_sequence_desc_then_type_desc() {
        let cmp = icmp();
        let ordered = [
            ikey(b"a", 100, ValueType::Value),
            ikey(b"a", 99, ValueType::Value),
            ikey(b"a", 99, ValueType::Deletion),
            ikey(b"b", 200, ValueType::Value),
            ikey(b"b", 1, ValueType::Deletion),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                cmp.cmp(&window[0], &window[1]),
                Ordering::Less,
                "{window:?}",
            );
        }
    }

    #[test]
    fn lookup_key_views_agree() {
        let lookup = LookupKey::new(b"the-key", SequenceNumber(42));
        assert_eq!(lookup.user_key(), b"the-key");
        assert_eq!(extract_user_key(lookup.internal_key()), b"the-key");
        let (framed, rest) = decode_length_prefixed(lookup.memtable_key()).unwrap();
        assert_eq!(framed, lookup.internal_key());
        assert!(rest.is_empty());
    }

    #[test]
    fn lookup_key_sorts_before_equal_and_older_entries() {
        let cmp = icmp();
        let lookup = LookupKey::new(b"k", SequenceNumber(50));
        // Entries visible at sequence 50 sort at-or-after the lookup key.
        assert!(cmp.cmp(lookup.internal_key(), &ikey(b"k", 50, ValueType::Value)).is_le());
        assert!(cmp.cmp(lookup.internal_key(), &ikey(b"k", 10, ValueType::Value)).is_lt());
        // Too-new entries sort before it.
        assert!(cmp.cmp(&ikey(b"k", 51, ValueType::Value), lookup.internal_key()).is_lt());
    }

    #[test]
    fn separator_keeps_internal_ordering() {
        let cmp = icmp();
        let from = ikey(b"abcdefg", 5, ValueType::Value);
        let to = ikey(b"abzzzzz", 900, ValueType::Value);
        let mut separator = Vec::new();
        cmp.find_short_separator(&from, &to, &mut separator);
        assert!(separator.len() < from.len());
        assert_eq!(cmp.cmp(&from, &separator), Ordering::Less);
        assert_eq!(cmp.cmp(&separator, &to), Ordering::Less);
    }

    #[test]
    fn internal_filter_strips_tags() {
        use silt_sstable::filter::BloomFilterPolicy;

        let policy = InternalFilterPolicy {
            user_policy: Arc::new(BloomFilterPolicy::default()),
        };

        let keys = [ikey(b"apple", 7, ValueType::Value), ikey(b"pear", 9, ValueType::Deletion)];
        let mut flattened = Vec::new();
        let mut offsets = Vec::new();
        for key in &keys {
            offsets.push(flattened.len());
            flattened.extend_from_slice(key);
        }
        let mut filter = Vec::new();
        policy.create_filter(&flattened, &offsets, &mut filter);

        // A probe with a different sequence still matches on the user key.
        assert!(policy.key_may_match(&ikey(b"apple", 12345, ValueType::Value), &filter));
        assert!(!policy.key_may_match(&ikey(b"grape", 7, ValueType::Value), &filter));
    }
}
