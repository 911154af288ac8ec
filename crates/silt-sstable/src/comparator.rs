use std::cmp::Ordering;
use std::fmt::Debug;


/// A total order over byte-string keys, plus the key-shortening hooks the
/// table builder uses to keep index blocks small.
///
/// The shortening methods may emit any key that preserves the stated
/// ordering relations; emitting the input unchanged is always correct.
pub trait Comparator: Debug + Send + Sync {
    /// Identifies the comparator. Persisted in the database catalog, and
    /// checked on reopen: a database must always be opened with the
    /// comparator that wrote it.
    fn name(&self) -> &'static str;

    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Write into `separator` a key `k` with `from <= k < to`, ideally
    /// shorter than `from`. Called with `from < to`.
    fn find_short_separator(&self, from: &[u8], to: &[u8], separator: &mut Vec<u8>);

    /// Write into `successor` a key `k >= key`, ideally shorter than `key`.
    fn find_short_successor(&self, key: &[u8], successor: &mut Vec<u8>);
}

/// Lexicographic byte order; the default user-key comparator.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "leveldb.BytewiseComparator"
    }

    #[inline]
    fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_short_separator(&self, from: &[u8], to: &[u8], separator: &mut Vec<u8>) {
        separator.clear();

        let shared = common_prefix_len(from, to);
        if shared == from.len() || shared == to.len() {
            // One key is a prefix of the other; no shortening is possible.
            separator.extend_from_slice(from);
            return;
        }

        let diverging_byte = from[shared];
        if diverging_byte < 0xff && diverging_byte + 1 < to[shared] {
            // The shared prefix plus one incremented byte sits strictly
            // between `from` and `to`.
            separator.extend_from_slice(&from[..=shared]);
            separator[shared] = diverging_byte + 1;
        } else {
            separator.extend_from_slice(from);
        }
    }

    fn find_short_successor(&self, key: &[u8], successor: &mut Vec<u8>) {
        successor.clear();

        // Keep everything up to and including the first byte that can be
        // incremented. A key of all-0xff bytes has no short successor.
        for (index, &byte) in key.iter().enumerate() {
            if byte != 0xff {
                successor.extend_from_slice(&key[..=index]);
                successor[index] = byte + 1;
                return;
            }
        }
        successor.extend_from_slice(key);
    }
}

#[must_use]
pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(byte_a, byte_b)| byte_a == byte_b).count()
}


#[cfg(test)]
mod tests {
    use super::*;

    fn separator(from: &[u8], to: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        BytewiseComparator.find_short_separator(from, to, &mut out);
        out
    }

    #[test]
    fn separator_shortens_where_possible() {
        assert_eq!(separator(b"abcdefghij", b"abzz"), b"abd");
        assert_eq!(separator(b"helloworld", b"hellp"), b"helloworld");
        assert_eq!(separator(b"abc", b"abcdef"), b"abc");
        assert_eq!(separator(b"", b"x"), b"");
    }

    #[test]
    fn separator_stays_in_range() {
        for (from, to) in [
            (&b"abc1xyz"[..], &b"abc9"[..]),
            (b"k01", b"k02"),
            (b"a\xff\xff", b"b"),
        ] {
            let sep = separator(from, to);
            assert!(sep.as_slice() >= from, "{sep:?} < {from:?}");
            assert!(sep.as_slice() < to, "{sep:?} >= {to:?}");
        }
    }

    #[test]
    fn successor_is_short_and_not_smaller() {
        let mut out = Vec::new();
        BytewiseComparator.find_short_successor(b"hello", &mut out);
        assert_eq!(out, b"i");

        BytewiseComparator.find_short_successor(b"\xff\xffzz", &mut out);
        assert_eq!(out, b"\xff\xff\x7b");

        BytewiseComparator.find_short_successor(b"\xff\xff", &mut out);
        assert_eq!(out, b"\xff\xff");
    }
}
