//! Process-local byte-bounded LRU cache.
//!
//! Level 1 of the cache tier. Values are serialized payloads; the cost of
//! an entry is its key length plus payload length. Inserting past the
//! capacity evicts least-recently-used entries until the total cost fits
//! again. Reads and writes share one lock; critical sections only touch
//! in-memory maps so contention stays short.

use super::keys;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Snapshot of L1 counters for stats endpoints and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L1Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: usize,
    pub capacity_bytes: usize,
}

#[derive(Debug)]
struct Entry {
    payload: Bytes,
    cost: usize,
}

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<String, Entry>,
    // Most recently used at the front.
    order: VecDeque<String>,
    used: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug)]
pub struct L1Cache {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl L1Cache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity: capacity_bytes,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.write().unwrap();
        if let Some(payload) = inner.map.get(key).map(|e| e.payload.clone()) {
            inner.hits += 1;
            touch(&mut inner.order, key);
            Some(payload)
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Insert an entry, evicting from the LRU end until the total cost is
    /// back under capacity. Returns the evicted keys so the tier can
    /// attribute eviction metrics per key family. An entry larger than
    /// the whole capacity is not admitted.
    pub fn put(&self, key: &str, payload: Bytes) -> Vec<String> {
        let cost = key.len() + payload.len();
        if cost > self.capacity {
            return Vec::new();
        }

        let mut inner = self.inner.write().unwrap();
        if let Some(old) = inner.map.remove(key) {
            inner.used -= old.cost;
            remove_key(&mut inner.order, key);
        }
        inner.map.insert(key.to_string(), Entry { payload, cost });
        inner.order.push_front(key.to_string());
        inner.used += cost;

        let mut evicted = Vec::new();
        while inner.used > self.capacity {
            let Some(victim) = inner.order.pop_back() else {
                break;
            };
            if let Some(entry) = inner.map.remove(&victim) {
                inner.used -= entry.cost;
                inner.evictions += 1;
                evicted.push(victim);
            }
        }
        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.map.remove(key) {
            inner.used -= entry.cost;
            remove_key(&mut inner.order, key);
            true
        } else {
            false
        }
    }

    /// Remove every key matching a glob pattern. Returns the removed keys.
    pub fn remove_matching(&self, pattern: &str) -> Vec<String> {
        let mut inner = self.inner.write().unwrap();
        let victims: Vec<String> = inner
            .map
            .keys()
            .filter(|k| keys::glob_match(pattern, k))
            .cloned()
            .collect();
        for key in &victims {
            if let Some(entry) = inner.map.remove(key) {
                inner.used -= entry.cost;
            }
            remove_key(&mut inner.order, key);
        }
        victims
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.map.clear();
        inner.order.clear();
        inner.used = 0;
    }

    pub fn stats(&self) -> L1Stats {
        let inner = self.inner.read().unwrap();
        L1Stats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.map.len(),
            used_bytes: inner.used,
            capacity_bytes: self.capacity,
        }
    }
}

fn touch(order: &mut VecDeque<String>, key: &str) {
    remove_key(order, key);
    order.push_front(key.to_string());
}

fn remove_key(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = L1Cache::new(1024);
        cache.put("module:acme", payload(10));
        assert_eq!(cache.get("module:acme"), Some(payload(10)));
        assert_eq!(cache.get("module:other"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_capacity_is_respected() {
        // Each entry costs key (4 bytes) + payload (60 bytes) = 64.
        let cache = L1Cache::new(128);
        cache.put("k001", payload(60));
        cache.put("k002", payload(60));
        assert_eq!(cache.stats().used_bytes, 128);

        let evicted = cache.put("k003", payload(60));
        assert_eq!(evicted, vec!["k001".to_string()]);
        assert!(cache.stats().used_bytes <= 128);
        assert_eq!(cache.get("k001"), None);
        assert!(cache.get("k002").is_some());
        assert!(cache.get("k003").is_some());
    }

    #[test]
    fn test_lru_order_follows_access() {
        let cache = L1Cache::new(128);
        cache.put("k001", payload(60));
        cache.put("k002", payload(60));
        // Touch k001 so k002 becomes the LRU victim.
        cache.get("k001");

        let evicted = cache.put("k003", payload(60));
        assert_eq!(evicted, vec!["k002".to_string()]);
        assert!(cache.get("k001").is_some());
    }

    #[test]
    fn test_oversized_entry_is_not_admitted() {
        let cache = L1Cache::new(32);
        cache.put("big", payload(64));
        assert_eq!(cache.get("big"), None);
        assert_eq!(cache.stats().used_bytes, 0);
    }

    #[test]
    fn test_overwrite_replaces_cost() {
        let cache = L1Cache::new(1024);
        cache.put("key", payload(100));
        cache.put("key", payload(10));
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.used_bytes, 3 + 10);
    }

    #[test]
    fn test_remove_matching_glob() {
        let cache = L1Cache::new(4096);
        cache.put("version:acme:v1", payload(8));
        cache.put("version:acme:v2", payload(8));
        cache.put("version:other:v1", payload(8));

        let mut removed = cache.remove_matching("version:acme:*");
        removed.sort();
        assert_eq!(removed, vec!["version:acme:v1", "version:acme:v2"]);
        assert!(cache.get("version:other:v1").is_some());
    }
}
