//! Capacity-bounded LRU set of content hashes for exact-duplicate detection.
//!
//! Membership is exact (no false positives). Once full, inserting a new
//! hash evicts the least-recently-used one, so a duplicate whose original
//! was evicted goes unnoticed (false negative). The bound is what keeps
//! memory flat across multi-million-record runs.

use std::collections::{BTreeMap, HashMap};

/// Rough per-entry footprint: a 64-char hex hash plus map overhead.
pub const APPROX_BYTES_PER_ENTRY: usize = 140;

/// LRU set keyed by text hash.
///
/// Recency is a monotonically increasing tick; `order` maps tick → hash so
/// the oldest entry is the first key of the `BTreeMap`.
#[derive(Debug, Clone)]
pub struct ExactHashCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, u64>,
    order: BTreeMap<u64, String>,
}

impl ExactHashCache {
    /// Create a cache holding at most `capacity` hashes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    /// Test-and-insert.
    ///
    /// Returns `true` if `hash` is already cached (refreshing its recency,
    /// without adding an entry). Otherwise inserts it, evicting the
    /// least-recently-used hash first when at capacity, and returns `false`.
    pub fn is_exact_duplicate(&mut self, hash: &str) -> bool {
        if self.touch(hash) {
            return true;
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.tick += 1;
        self.entries.insert(hash.to_string(), self.tick);
        self.order.insert(self.tick, hash.to_string());
        false
    }

    /// Membership test that does not affect recency.
    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// Drop `hash` from the cache. Returns whether it was present.
    pub fn remove(&mut self, hash: &str) -> bool {
        match self.entries.remove(hash) {
            Some(tick) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }

    /// Seed the cache from hashes ordered most-recent-first.
    ///
    /// Only the first `capacity` hashes can survive; they end up with the
    /// same relative recency they were given in.
    pub fn warm<I>(&mut self, most_recent_first: I)
    where
        I: IntoIterator<Item = String>,
    {
        let hashes: Vec<String> = most_recent_first.into_iter().take(self.capacity).collect();
        for hash in hashes.into_iter().rev() {
            self.is_exact_duplicate(&hash);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn approx_memory_bytes(&self) -> usize {
        self.entries.len() * APPROX_BYTES_PER_ENTRY
    }

    fn touch(&mut self, hash: &str) -> bool {
        let Some(tick) = self.entries.get_mut(hash) else {
            return false;
        };
        self.order.remove(tick);
        self.tick += 1;
        *tick = self.tick;
        self.order.insert(self.tick, hash.to_string());
        true
    }

    fn evict_oldest(&mut self) {
        if let Some((_, oldest)) = self.order.pop_first() {
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(i: usize) -> String {
        format!("hash-{:04}", i)
    }

    #[test]
    fn test_first_sighting_is_unique_second_is_duplicate() {
        let mut cache = ExactHashCache::new(10);
        assert!(!cache.is_exact_duplicate("a"));
        assert!(cache.is_exact_duplicate("a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_bounded_and_keeps_most_recent() {
        let capacity = 50;
        let mut cache = ExactHashCache::new(capacity);
        let n = 180;
        for i in 0..n {
            assert!(!cache.is_exact_duplicate(&h(i)));
        }
        assert_eq!(cache.len(), capacity);
        for i in 0..n {
            assert_eq!(cache.contains(&h(i)), i >= n - capacity, "entry {}", i);
        }
    }

    #[test]
    fn test_hit_refreshes_recency() {
        let mut cache = ExactHashCache::new(3);
        cache.is_exact_duplicate("a");
        cache.is_exact_duplicate("b");
        cache.is_exact_duplicate("c");
        // "a" becomes most recent, so "b" is the eviction victim.
        assert!(cache.is_exact_duplicate("a"));
        cache.is_exact_duplicate("d");
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_distinct_hashes_never_collide() {
        let mut cache = ExactHashCache::new(1000);
        for i in 0..500 {
            cache.is_exact_duplicate(&h(i));
        }
        for i in 500..1000 {
            assert!(!cache.is_exact_duplicate(&h(i)));
        }
    }

    #[test]
    fn test_evicted_duplicate_is_missed() {
        let mut cache = ExactHashCache::new(2);
        cache.is_exact_duplicate("a");
        cache.is_exact_duplicate("b");
        cache.is_exact_duplicate("c");
        // "a" was evicted: reported as unique again.
        assert!(!cache.is_exact_duplicate("a"));
    }

    #[test]
    fn test_remove_and_warm() {
        let mut cache = ExactHashCache::new(3);
        cache.warm(vec!["new".to_string(), "mid".to_string(), "old".to_string(), "oldest".to_string()]);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("oldest"));
        cache.is_exact_duplicate("fresh");
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));

        assert!(cache.remove("new"));
        assert!(!cache.remove("new"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = ExactHashCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.is_exact_duplicate("a");
        cache.is_exact_duplicate("b");
        assert_eq!(cache.len(), 1);
    }
}
