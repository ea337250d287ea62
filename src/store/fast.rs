//! Bounded in-process tier.
//!
//! Adaptive replacement policy: a recency list `t1` and a frequency list `t2`
//! share the configured capacity, with ghost lists `b1`/`b2` remembering
//! recently evicted keys. Hits on a ghost shift the adaptation target `p`
//! toward the list that would have kept the entry, so the tier tunes itself
//! between scan-heavy and hot-set workloads.
//!
//! Eviction hands the evicted entry back to the caller: a dirty entry (its
//! coalesced durable write has not completed) must be written back before the
//! in-memory copy is the only one left.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::resource::Resource;

/// A resident resource plus its write-back state.
#[derive(Debug)]
pub struct CacheEntry {
    pub resource: Resource,
    /// True until the durable write covering this value completes.
    pub dirty: bool,
}

/// Adaptive-replacement cache over resource keys.
pub struct FastTier {
    capacity: usize,
    /// Target size of `t1`; adapted on ghost hits.
    p: usize,
    t1: LruCache<String, CacheEntry>,
    t2: LruCache<String, CacheEntry>,
    b1: LruCache<String, ()>,
    b2: LruCache<String, ()>,
}

impl FastTier {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity: cap.get(),
            p: 0,
            t1: LruCache::new(cap),
            t2: LruCache::new(cap),
            b1: LruCache::new(cap),
            b2: LruCache::new(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.t1.contains(key) || self.t2.contains(key)
    }

    /// Look up without touching recency state.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.t1.peek(key).or_else(|| self.t2.peek(key))
    }

    /// Look up and promote: a `t1` hit graduates to `t2`.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        if let Some(entry) = self.t1.pop(key) {
            self.t2.put(key.to_string(), entry);
        }
        self.t2.get_mut(key)
    }

    pub fn get(&mut self, key: &str) -> Option<&Resource> {
        self.get_mut(key).map(|entry| &entry.resource)
    }

    /// Insert or update, returning any entry evicted to make room.
    pub fn insert(&mut self, key: &str, resource: Resource, dirty: bool) -> Vec<(String, CacheEntry)> {
        let entry = CacheEntry { resource, dirty };

        // Resident hit: update in place, graduate to the frequency list.
        if self.t1.contains(key) || self.t2.contains(key) {
            self.t1.pop(key);
            self.t2.put(key.to_string(), entry);
            return Vec::new();
        }

        let mut evicted = Vec::new();

        if self.b1.pop(key).is_some() {
            // Ghost hit in b1: recency list was too small.
            let delta = (self.b2.len() / self.b1.len().max(1)).max(1);
            self.p = (self.p + delta).min(self.capacity);
            evicted.extend(self.replace(false));
            self.t2.put(key.to_string(), entry);
            return evicted;
        }

        if self.b2.pop(key).is_some() {
            // Ghost hit in b2: frequency list was too small.
            let delta = (self.b1.len() / self.b2.len().max(1)).max(1);
            self.p = self.p.saturating_sub(delta);
            evicted.extend(self.replace(true));
            self.t2.put(key.to_string(), entry);
            return evicted;
        }

        // Cold miss.
        let l1 = self.t1.len() + self.b1.len();
        if l1 == self.capacity {
            if self.t1.len() < self.capacity {
                self.b1.pop_lru();
                evicted.extend(self.replace(false));
            } else if let Some((k, e)) = self.t1.pop_lru() {
                evicted.push((k, e));
            }
        } else {
            let total = self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len();
            if total >= self.capacity {
                if total == 2 * self.capacity {
                    self.b2.pop_lru();
                }
                evicted.extend(self.replace(false));
            }
        }
        self.t1.put(key.to_string(), entry);
        evicted
    }

    /// Remove an entry and forget its ghosts.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.b1.pop(key);
        self.b2.pop(key);
        self.t1.pop(key).or_else(|| self.t2.pop(key))
    }

    pub fn mark_clean(&mut self, key: &str) {
        if let Some(entry) = self.t1.peek_mut(key).or_else(|| self.t2.peek_mut(key)) {
            entry.dirty = false;
        }
    }

    fn replace(&mut self, ghost_hit_in_b2: bool) -> Option<(String, CacheEntry)> {
        let from_t1 = !self.t1.is_empty()
            && (self.t1.len() > self.p || (ghost_hit_in_b2 && self.t1.len() == self.p));
        if from_t1 {
            let (key, entry) = self.t1.pop_lru()?;
            self.b1.put(key.clone(), ());
            Some((key, entry))
        } else if let Some((key, entry)) = self.t2.pop_lru() {
            self.b2.put(key.clone(), ());
            Some((key, entry))
        } else {
            let (key, entry) = self.t1.pop_lru()?;
            self.b1.put(key.clone(), ());
            Some((key, entry))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(key: &str) -> Resource {
        Resource::new(key)
    }

    fn tier(capacity: usize) -> FastTier {
        FastTier::new(capacity)
    }

    #[test]
    fn bounded_by_capacity() {
        let mut tier = tier(3);
        for i in 0..10 {
            tier.insert(&format!("k{i}"), res(&format!("k{i}")), false);
        }
        assert_eq!(tier.len(), 3);
    }

    #[test]
    fn eviction_returns_entry() {
        let mut tier = tier(2);
        assert!(tier.insert("a", res("a"), true).is_empty());
        assert!(tier.insert("b", res("b"), false).is_empty());

        let evicted = tier.insert("c", res("c"), false);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "a");
        assert!(evicted[0].1.dirty);
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn frequent_entries_survive_a_scan() {
        let mut tier = tier(4);
        tier.insert("hot", res("hot"), false);
        // Promote to the frequency list.
        assert!(tier.get("hot").is_some());

        for i in 0..8 {
            tier.insert(&format!("scan{i}"), res(&format!("scan{i}")), false);
        }
        assert!(tier.contains("hot"));
    }

    #[test]
    fn ghost_hit_reenters_frequency_list() {
        let mut tier = tier(2);
        tier.insert("a", res("a"), false);
        assert!(tier.get("a").is_some()); // graduate "a" to t2
        tier.insert("b", res("b"), false);
        tier.insert("c", res("c"), false); // evicts "b" to the b1 ghost

        assert!(!tier.contains("b"));
        tier.insert("b", res("b"), false);
        assert!(tier.contains("b"));
        // a ghost hit lands directly in t2
        assert!(tier.t2.contains("b"));
    }

    #[test]
    fn update_in_place_does_not_evict() {
        let mut tier = tier(2);
        tier.insert("a", res("a"), false);
        tier.insert("b", res("b"), false);

        let evicted = tier.insert("a", res("a").with_data("v2"), true);
        assert!(evicted.is_empty());
        assert_eq!(tier.len(), 2);
        assert!(tier.peek("a").is_some_and(|e| e.dirty));
    }

    #[test]
    fn remove_forgets_ghosts() {
        let mut tier = tier(2);
        tier.insert("a", res("a"), false);
        assert!(tier.get("a").is_some());
        tier.insert("b", res("b"), false);
        tier.insert("c", res("c"), false); // "b" becomes a b1 ghost

        tier.remove("b");
        // A fresh insert of "b" is a cold miss again, not a ghost hit.
        tier.insert("b", res("b"), false);
        assert!(tier.t1.contains("b"));
    }

    #[test]
    fn mark_clean_clears_dirty_flag() {
        let mut tier = tier(2);
        tier.insert("a", res("a"), true);
        tier.mark_clean("a");
        assert!(tier.peek("a").is_some_and(|e| !e.dirty));
    }
}
