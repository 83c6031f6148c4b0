//! Recently committed blocks and transactions
//!
//! The durable store may lag behind what was just written to it. These small
//! bounded caches serve reads of freshly committed data until the store
//! catches up.

use crate::types::Hash;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Bounded FIFO map from hash to a committed value.
///
/// Lookups use `peek`, which does not promote entries, so the oldest insert
/// is always evicted first.
pub struct RecentCache<T> {
    entries: LruCache<Hash, T>,
}

impl<T: Clone> RecentCache<T> {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        RecentCache {
            entries: LruCache::new(capacity),
        }
    }

    /// Insert or replace. Replacing does not refresh the entry's age.
    pub fn put(&mut self, hash: Hash, value: T) {
        if let Some(existing) = self.entries.peek_mut(&hash) {
            *existing = value;
            return;
        }
        self.entries.put(hash, value);
    }

    pub fn get(&self, hash: &Hash) -> Option<T> {
        self.entries.peek(hash).cloned()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains(hash)
    }

    /// Mutate a cached value in place, if present.
    pub fn update<F: FnOnce(&mut T)>(&mut self, hash: &Hash, f: F) -> bool {
        match self.entries.peek_mut(hash) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<T> {
        self.entries.pop(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Hashes currently cached, newest first.
    pub fn hashes(&self) -> Vec<Hash> {
        self.entries.iter().map(|(hash, _)| *hash).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> Hash {
        [n; 32]
    }

    #[test]
    fn test_evicts_oldest_insert() {
        let mut cache = RecentCache::new(2);
        cache.put(h(1), "a");
        cache.put(h(2), "b");
        // Reads must not refresh age.
        assert_eq!(cache.get(&h(1)), Some("a"));
        cache.put(h(3), "c");

        assert!(!cache.contains(&h(1)));
        assert!(cache.contains(&h(2)));
        assert!(cache.contains(&h(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replace_keeps_age() {
        let mut cache = RecentCache::new(2);
        cache.put(h(1), 1);
        cache.put(h(2), 2);
        cache.put(h(1), 10);
        cache.put(h(3), 3);

        assert_eq!(cache.get(&h(1)), None);
        assert_eq!(cache.get(&h(2)), Some(2));
    }

    #[test]
    fn test_update_in_place() {
        let mut cache = RecentCache::new(4);
        cache.put(h(1), false);
        assert!(cache.update(&h(1), |active| *active = true));
        assert_eq!(cache.get(&h(1)), Some(true));
        assert!(!cache.update(&h(9), |active| *active = true));
    }

    #[test]
    fn test_zero_capacity() {
        let mut cache = RecentCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put(h(1), ());
        cache.put(h(2), ());
        assert_eq!(cache.hashes(), vec![h(2)]);
        assert!(cache.remove(&h(2)).is_some());
        assert!(cache.is_empty());
    }
}
