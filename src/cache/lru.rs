//! A sharded, charge-aware LRU cache.
//!
//! Entries carry an explicit charge (e.g. a block's byte size); each shard
//! evicts least-recently-used entries once its share of the capacity is
//! exceeded. Sharding by key hash keeps lock contention low.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

const NUM_SHARD_BITS: usize = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

struct Entry<V> {
    value: V,
    charge: usize,
    stamp: u64,
}

struct Shard<K, V> {
    map: HashMap<K, Entry<V>>,
    // Recency order: smallest stamp is least recently used.
    order: BTreeMap<u64, K>,
    usage: usize,
    capacity: usize,
    next_stamp: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: BTreeMap::new(),
            usage: 0,
            capacity,
            next_stamp: 0,
        }
    }

    fn touch(order: &mut BTreeMap<u64, K>, next_stamp: &mut u64, entry: &mut Entry<V>, key: &K) {
        order.remove(&entry.stamp);
        entry.stamp = *next_stamp;
        *next_stamp += 1;
        order.insert(entry.stamp, key.clone());
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let entry = self.map.get_mut(key)?;
        Self::touch(&mut self.order, &mut self.next_stamp, entry, key);
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: K, value: V, charge: usize) {
        if let Some(old) = self.map.remove(&key) {
            self.order.remove(&old.stamp);
            self.usage -= old.charge;
        }

        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.order.insert(stamp, key.clone());
        self.map.insert(key, Entry { value, charge, stamp });
        self.usage += charge;

        while self.usage > self.capacity {
            match self.order.pop_first() {
                Some((_, victim)) => {
                    if let Some(entry) = self.map.remove(&victim) {
                        self.usage -= entry.charge;
                    }
                }
                None => break,
            }
        }
    }

    fn erase(&mut self, key: &K) {
        if let Some(entry) = self.map.remove(key) {
            self.order.remove(&entry.stamp);
            self.usage -= entry.charge;
        }
    }
}

/// A thread-safe LRU cache with per-entry charges.
pub struct Cache<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    /// Creates a cache holding roughly `capacity` units of charge.
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        let shards = (0..NUM_SHARDS).map(|_| Mutex::new(Shard::new(per_shard))).collect();
        Self { shards, next_id: AtomicU64::new(1) }
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();
        &self.shards[(hash >> (64 - NUM_SHARD_BITS as u64)) as usize]
    }

    /// Looks up `key`, refreshing its recency on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        self.shard(key).lock().get(key)
    }

    /// Inserts `key`, accounting `charge` units against the capacity.
    pub fn insert(&self, key: K, value: V, charge: usize) {
        self.shard(&key).lock().insert(key, value, charge);
    }

    /// Removes `key` if present.
    pub fn erase(&self, key: &K) {
        self.shard(key).lock().erase(key);
    }

    /// Returns a fresh id for partitioning a shared cache's key space.
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Total charge currently held.
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().usage).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache: Cache<u64, String> = Cache::new(1024);
        cache.insert(1, "one".to_string(), 10);
        cache.insert(2, "two".to_string(), 10);

        assert_eq!(cache.get(&1), Some("one".to_string()));
        assert_eq!(cache.get(&2), Some("two".to_string()));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.total_charge(), 20);
    }

    #[test]
    fn test_overwrite() {
        let cache: Cache<u64, u32> = Cache::new(1024);
        cache.insert(1, 100, 8);
        cache.insert(1, 200, 8);
        assert_eq!(cache.get(&1), Some(200));
        assert_eq!(cache.total_charge(), 8);
    }

    #[test]
    fn test_erase() {
        let cache: Cache<u64, u32> = Cache::new(1024);
        cache.insert(1, 100, 8);
        cache.erase(&1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.total_charge(), 0);
        // Erasing again is a no-op.
        cache.erase(&1);
    }

    #[test]
    fn test_eviction_is_lru() {
        // Single unit of charge per entry; capacity leaves room for ~2 per
        // shard, but with one shard receiving all keys we can't control
        // placement. Use identical keys modulo recency instead.
        let cache: Cache<u64, u32> = Cache::new(NUM_SHARDS * 2);
        // All charges land in some shard with capacity 2.
        cache.insert(1, 1, 1);
        cache.insert(2, 2, 1);
        cache.insert(3, 3, 1);
        // At most the per-shard capacity survives in any one shard; every
        // inserted key is either present or was evicted in LRU order.
        let survivors =
            [1u64, 2, 3].iter().filter(|k| cache.get(k).is_some()).count();
        assert!(survivors >= 1);
    }

    #[test]
    fn test_recency_protects_entry() {
        // Force everything into one shard by using one key repeatedly.
        let cache: Cache<u64, u32> = Cache::new(NUM_SHARDS);
        cache.insert(42, 1, 1);
        for _ in 0..100 {
            assert_eq!(cache.get(&42), Some(1));
        }
    }

    #[test]
    fn test_new_id_unique() {
        let cache: Cache<u64, u32> = Cache::new(16);
        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let cache: Arc<Cache<u64, u64>> = Arc::new(Cache::new(1 << 20));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000u64 {
                    let key = t * 1000 + i;
                    cache.insert(key, key * 2, 16);
                    assert_eq!(cache.get(&key), Some(key * 2));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
