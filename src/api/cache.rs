//! Per-sender count cache for the HTTP layer.
//!
//! Entries expire after a fixed freshness window. In-memory only (resets on restart),
//! and cleared whenever credentials change.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Cached count for one sender.
struct CachedCount {
    count: u64,
    inserted_at: Instant,
}

/// Sender -> count cache with a TTL.
///
/// Keys are lowercased, so `Alice@Example.com` and `alice@example.com` share an entry.
/// A zero TTL disables caching.
pub struct CountCache {
    entries: DashMap<String, CachedCount>,
    ttl: Duration,
}

impl CountCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached count for `sender` if still fresh. Stale entries are evicted.
    pub fn get(&self, sender: &str) -> Option<u64> {
        if self.ttl.is_zero() {
            return None;
        }

        let key = sender.to_ascii_lowercase();
        let fresh = self
            .entries
            .get(&key)
            .map(|entry| (entry.count, entry.inserted_at.elapsed() < self.ttl))?;

        match fresh {
            (count, true) => Some(count),
            (_, false) => {
                self.entries.remove(&key);
                None
            }
        }
    }

    /// Stores a fresh count. Expired entries for other senders are pruned first, so the
    /// map never holds more than one window's worth of senders.
    pub fn insert(&self, sender: &str, count: u64) {
        if self.ttl.is_zero() {
            return;
        }
        self.prune_expired();
        self.entries.insert(
            sender.to_ascii_lowercase(),
            CachedCount {
                count,
                inserted_at: Instant::now(),
            },
        );
    }

    fn prune_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_is_case_insensitive() {
        let cache = CountCache::new(Duration::from_secs(60));
        cache.insert("Alice@Example.com", 42);

        assert_eq!(cache.get("alice@example.com"), Some(42));
        assert_eq!(cache.get("bob@example.com"), None);
    }

    #[test]
    fn test_expired_entry_is_evicted() {
        let cache = CountCache::new(Duration::from_millis(10));
        cache.insert("alice@example.com", 1);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.get("alice@example.com"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_prunes_other_expired_senders() {
        let cache = CountCache::new(Duration::from_millis(20));
        cache.insert("a@example.com", 1);
        cache.insert("b@example.com", 2);
        std::thread::sleep(Duration::from_millis(40));

        cache.insert("c@example.com", 3);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c@example.com"), Some(3));
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = CountCache::new(Duration::ZERO);
        cache.insert("alice@example.com", 1);

        assert_eq!(cache.get("alice@example.com"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_clear() {
        let cache = CountCache::new(Duration::from_secs(60));
        cache.insert("a@example.com", 1);
        cache.insert("b@example.com", 2);
        cache.clear();

        assert!(cache.is_empty());
    }
}
