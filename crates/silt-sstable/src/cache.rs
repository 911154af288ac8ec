//! A sharded, capacity-bounded LRU cache with pinned handles.
//!
//! Values are handed out as `Arc<V>`: the cache holds one reference, and
//! every `lookup`/`insert` returns another. Eviction and [`erase`] only drop
//! the cache's reference, so a value stays alive (and usable) for as long as
//! any caller still holds its handle - the moral equivalent of the classic
//! deleter-on-last-release cache design.
//!
//! The key space is split over 16 shards by the top four bits of the key
//! hash, each shard behind its own mutex, so block loads on different shards
//! never contend.
//!
//! [`erase`]: ShardedCache::erase

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash, RandomState};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrder};

use parking_lot::Mutex;


const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

/// Cache key for uncompressed data blocks: the owning table's cache id and
/// the block's offset within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockCacheKey {
    pub cache_id: u64,
    pub offset:   u64,
}

struct CacheEntry<V> {
    value:  Arc<V>,
    charge: usize,
    /// Recency stamp; the key of this entry's slot in `Shard::recency`.
    tick:   u64,
}

struct Shard<K, V> {
    entries:   HashMap<K, CacheEntry<V>>,
    /// Ticks in ascending order of recency; the front is next to evict.
    recency:   BTreeMap<u64, K>,
    usage:     usize,
    capacity:  usize,
    next_tick: u64,
}

impl<K: Hash + Eq + Clone, V> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries:   HashMap::new(),
            recency:   BTreeMap::new(),
            usage:     0,
            capacity,
            next_tick: 0,
        }
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) {
        if let Some(old) = self.entries.remove(&key) {
            self.usage -= old.charge;
            self.recency.remove(&old.tick);
        }

        let tick = self.next_tick;
        self.next_tick += 1;
        self.recency.insert(tick, key.clone());
        self.entries.insert(key, CacheEntry { value, charge, tick });
        self.usage += charge;

        self.evict_to_capacity();
    }

    fn lookup(&mut self, key: &K) -> Option<Arc<V>> {
        let entry = self.entries.get_mut(key)?;

        let tick = self.next_tick;
        self.next_tick += 1;
        self.recency.remove(&entry.tick);
        self.recency.insert(tick, key.clone());
        entry.tick = tick;

        Some(Arc::clone(&entry.value))
    }

    fn erase(&mut self, key: &K) {
        if let Some(entry) = self.entries.remove(key) {
            self.usage -= entry.charge;
            self.recency.remove(&entry.tick);
        }
    }

    fn evict_to_capacity(&mut self) {
        while self.usage > self.capacity {
            let Some((_, oldest_key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest_key) {
                self.usage -= entry.charge;
            }
        }
    }
}

/// The sharded LRU. See the module docs.
pub struct ShardedCache<K, V> {
    shards:  [Mutex<Shard<K, V>>; NUM_SHARDS],
    hasher:  RandomState,
    next_id: AtomicU64,
}

impl<K: Hash + Eq + Clone, V> ShardedCache<K, V> {
    /// A cache holding at most `capacity` total charge, split evenly across
    /// the shards (rounding up, as the original does).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let per_shard = capacity.div_ceil(NUM_SHARDS);
        Self {
            shards:  std::array::from_fn(|_| Mutex::new(Shard::new(per_shard))),
            hasher:  RandomState::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert `value` under `key`, accounting `charge` bytes against the
    /// capacity, and return a pinned handle to it. Replaces any previous
    /// entry for `key`.
    pub fn insert(&self, key: K, value: V, charge: usize) -> Arc<V> {
        let value = Arc::new(value);
        self.shard(&key).lock().insert(key, Arc::clone(&value), charge);
        value
    }

    /// Look up `key`, refreshing its recency.
    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key).lock().lookup(key)
    }

    /// Drop the cache's reference to `key`, if present. Outstanding handles
    /// remain valid.
    pub fn erase(&self, key: &K) {
        self.shard(key).lock().erase(key);
    }

    /// A fresh id, for namespacing the keys of distinct cache users (each
    /// open table gets one to prefix its block offsets with).
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, AtomicOrder::Relaxed)
    }

    /// Total charge currently accounted across all shards.
    #[must_use]
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().usage).sum()
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let hash = self.hasher.hash_one(key);
        let shard_index = (hash >> (64 - NUM_SHARD_BITS)) as usize;
        &self.shards[shard_index]
    }
}

impl<K, V> std::fmt::Debug for ShardedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedCache")
            .field("shards", &NUM_SHARDS)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    /// A single-shard view for deterministic eviction tests: everything is
    /// charged against one shard by using one key hash bucket... instead,
    /// just use a tiny capacity and single-key-space assertions.
    fn cache(capacity: usize) -> ShardedCache<u64, String> {
        ShardedCache::new(capacity)
    }

    #[test]
    fn lookup_returns_inserted_value() {
        let cache = cache(1024);
        cache.insert(1, "one".to_owned(), 3);
        assert_eq!(cache.lookup(&1).as_deref(), Some(&"one".to_owned()));
        assert_eq!(cache.lookup(&2), None);
    }

    #[test]
    fn reinsert_replaces_and_reaccounts() {
        let cache = cache(1024);
        cache.insert(1, "one".to_owned(), 100);
        cache.insert(1, "uno".to_owned(), 5);
        assert_eq!(cache.lookup(&1).as_deref(), Some(&"uno".to_owned()));
        assert_eq!(cache.total_charge(), 5);
    }

    #[test]
    fn eviction_is_least_recently_used() {
        // One shard holds div_ceil(32, 16) == 2 units; two unit-charge
        // entries that land in the same shard evict in LRU order. Use many
        // keys so that some shard certainly receives three entries.
        let cache = cache(32);
        for key in 0..64 {
            cache.insert(key, format!("v{key}"), 1);
        }
        let survivors = (0..64).filter(|key| cache.lookup(key).is_some()).count();
        assert!(survivors <= 32, "{survivors} entries survived eviction");
        // Recently inserted keys are favored.
        assert!(cache.lookup(&63).is_some());
    }

    #[test]
    fn pinned_handles_survive_eviction_and_erase() {
        let cache = cache(16);
        let pinned = cache.insert(7, "pinned".to_owned(), 1);

        cache.erase(&7);
        assert_eq!(cache.lookup(&7), None);
        assert_eq!(&*pinned, "pinned");

        for key in 100..200 {
            cache.insert(key, "filler".to_owned(), 1);
        }
        assert_eq!(&*pinned, "pinned");
    }

    #[test]
    fn erase_frees_charge() {
        let cache = cache(64);
        cache.insert(3, "x".to_owned(), 10);
        assert_eq!(cache.total_charge(), 10);
        cache.erase(&3);
        assert_eq!(cache.total_charge(), 0);
        // Erasing an absent key is a no-op.
        cache.erase(&3);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let cache = cache(1);
        let first = cache.new_id();
        let second = cache.new_id();
        assert!(second > first);
    }

    #[test]
    fn zero_capacity_still_serves_pins() {
        let cache = cache(0);
        let handle = cache.insert(1, "v".to_owned(), 1);
        assert_eq!(&*handle, "v");
    }
}
