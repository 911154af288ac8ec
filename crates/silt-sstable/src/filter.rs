use std::fmt::Debug;


/// Builds and queries per-block key filters.
///
/// Keys for one filter are handed over flattened: `flattened_keys` is the
/// concatenation of all keys and `key_offsets[i]` is where key `i` starts.
/// `key_may_match` must never return `false` for a key the filter was built
/// from; false positives are allowed.
pub trait FilterPolicy: Debug + Send + Sync {
    /// Persisted in the table's metaindex as `filter.<name>`; a reader only
    /// uses a filter block whose name matches its configured policy.
    fn name(&self) -> &'static str;

    /// Append a filter for the given keys to `filter`, without touching the
    /// existing contents.
    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>);

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// The hash function the Bloom filter format is defined over.
fn bloom_hash(data: &[u8]) -> u32 {
    const SEED: u32 = 0xbc9f_1d34;
    const MULTIPLIER: u32 = 0xc6a4_a793;

    let mut hash = SEED ^ (data.len() as u32).wrapping_mul(MULTIPLIER);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes(chunk.try_into().expect("chunk of 4 bytes"));
        hash = hash.wrapping_add(word).wrapping_mul(MULTIPLIER);
        hash ^= hash >> 16;
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        for (index, &byte) in remainder.iter().enumerate() {
            hash = hash.wrapping_add(u32::from(byte) << (8 * index));
        }
        // The final mix shifts by 24, not 16; the stored format depends on it.
        hash = hash.wrapping_mul(MULTIPLIER);
        hash ^= hash >> 24;
    }

    hash
}

/// A Bloom filter policy: `bits_per_key` filter bits per key, with the number
/// of probe positions derived as `bits_per_key * ln 2`, clamped to `1..=30`.
///
/// Each stored filter ends in one byte recording its probe count, so readers
/// can match filters built with a different `bits_per_key`.
#[derive(Debug, Clone, Copy)]
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    num_probes:   u8,
}

impl BloomFilterPolicy {
    #[must_use]
    pub fn new(bits_per_key: usize) -> Self {
        // ln 2 ~= 0.69; round down to keep false positives cheap.
        let num_probes = (bits_per_key * 69 / 100).clamp(1, 30) as u8;
        Self {
            bits_per_key,
            num_probes,
        }
    }
}

impl Default for BloomFilterPolicy {
    /// 10 bits per key: a false-positive rate just under 1%.
    fn default() -> Self {
        Self::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "leveldb.BuiltinBloomFilter2"
    }

    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>) {
        // At least 64 bits, to keep the false-positive rate of tiny filters
        // from ballooning.
        let num_bits = (key_offsets.len() * self.bits_per_key).max(64);
        let num_bytes = num_bits.div_ceil(8);
        let num_bits = (num_bytes * 8) as u32;

        let filter_start = filter.len();
        filter.resize(filter_start + num_bytes, 0);
        filter.push(self.num_probes);
        let filter_bits = &mut filter[filter_start..filter_start + num_bytes];

        for (index, &key_start) in key_offsets.iter().enumerate() {
            let key_end = key_offsets
                .get(index + 1)
                .copied()
                .unwrap_or(flattened_keys.len());
            let key = &flattened_keys[key_start..key_end];

            let mut hash = bloom_hash(key);
            let delta = hash.rotate_right(17);
            for _ in 0..self.num_probes {
                let bit = (hash % num_bits) as usize;
                filter_bits[bit / 8] |= 1 << (bit % 8);
                hash = hash.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }

        let num_probes = filter[filter.len() - 1];
        if num_probes > 30 {
            // Reserved for future filter encodings; treat as a match.
            return true;
        }
        let filter_bits = &filter[..filter.len() - 1];
        let num_bits = (filter_bits.len() * 8) as u32;

        let mut hash = bloom_hash(key);
        let delta = hash.rotate_right(17);
        for _ in 0..num_probes {
            let bit = (hash % num_bits) as usize;
            if filter_bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            hash = hash.wrapping_add(delta);
        }
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn build_filter(policy: &BloomFilterPolicy, keys: &[&[u8]]) -> Vec<u8> {
        let mut flattened = Vec::new();
        let mut offsets = Vec::new();
        for key in keys {
            offsets.push(flattened.len());
            flattened.extend_from_slice(key);
        }
        let mut filter = Vec::new();
        policy.create_filter(&flattened, &offsets, &mut filter);
        filter
    }

    #[test]
    fn no_false_negatives() {
        let policy = BloomFilterPolicy::default();
        let keys: Vec<Vec<u8>> = (0..1000_u32).map(|i| i.to_le_bytes().to_vec()).collect();
        let borrowed: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let filter = build_filter(&policy, &borrowed);

        for key in &keys {
            assert!(policy.key_may_match(key, &filter), "false negative for {key:?}");
        }
    }

    #[test]
    fn false_positive_rate_is_reasonable() {
        let policy = BloomFilterPolicy::default();
        let keys: Vec<Vec<u8>> = (0..1000_u32).map(|i| i.to_le_bytes().to_vec()).collect();
        let borrowed: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let filter = build_filter(&policy, &borrowed);

        let false_positives = (1000..11_000_u32)
            .filter(|i| policy.key_may_match(&i.to_le_bytes(), &filter))
            .count();
        // ~1% expected with 10 bits/key; allow generous slack.
        assert!(false_positives < 300, "{false_positives} false positives out of 10000");
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let policy = BloomFilterPolicy::default();
        assert!(!policy.key_may_match(b"anything", &[]));
    }

    #[test]
    fn tiny_filter_keeps_minimum_size() {
        let policy = BloomFilterPolicy::default();
        let filter = build_filter(&policy, &[b"one"]);
        // 64 bits minimum plus the probe-count byte.
        assert_eq!(filter.len(), 9);
        assert!(policy.key_may_match(b"one", &filter));
    }

    #[test]
    fn hash_matches_reference_shape() {
        // Spot checks that the mixing behaves: distinct short keys hash apart.
        let hashes: Vec<u32> = [&b""[..], b"a", b"ab", b"abc", b"abcd", b"abcde"]
            .iter()
            .map(|key| bloom_hash(key))
            .collect();
        let mut deduped = hashes.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), hashes.len());
    }
}
