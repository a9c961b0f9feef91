use super::ttl_cache::{CacheStats, TtlCache};
use std::hash::Hash;
use std::time::Duration;

/// Presence-only TTL cache
///
/// Used to remember which targets were already processed within a horizon
/// without keeping that memory forever.
pub struct TtlSet<K: Hash + Eq> {
    inner: TtlCache<K, ()>,
}

impl<K> TtlSet<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: TtlCache::new(capacity, ttl),
        }
    }

    /// Records `key`, refreshing its expiry if already present
    pub fn insert(&self, key: K) {
        self.inner.set(key, ());
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.get(key).is_some()
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    pub fn force_cleanup(&self, target_fraction: f64) -> usize {
        self.inner.force_cleanup(target_fraction)
    }

    pub fn clear(&self) {
        self.inner.clear()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}
