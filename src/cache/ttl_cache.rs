//! Expiring key/value cache with LRU eviction

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A cached value and the instant it stops being visible
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Counters exposed for logging and memory decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub len: usize,
    pub capacity: usize,
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Bounded cache whose entries expire after a TTL
///
/// All map mutation happens under one mutex. The lock is never held across an
/// await point; every method is synchronous.
///
/// # Memory Bounds
///
/// Capacity is enforced on insert by evicting the least-recently-used entry.
/// Entries that are never read again are removed by [`TtlCache::purge_expired`],
/// which the owner runs periodically (see [`super::spawn_sweeper`]).
pub struct TtlCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    default_ttl: Duration,
    capacity: NonZeroUsize,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            default_ttl,
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        // A panic while holding the lock leaves the map consistent: every
        // mutation below is a single LruCache call.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the value for `key` if present and not expired
    ///
    /// An expired entry is removed and counted as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                let value = entry.value.clone();
                inner.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.pop(key);
            inner.expirations += 1;
        }
        inner.misses += 1;
        None
    }

    /// Returns true if `key` is present and not expired, without touching LRU order
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Inserts `value` with the default TTL
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Inserts `value` expiring after `ttl`
    ///
    /// When the cache is full and `key` is new, the least-recently-used entry
    /// is evicted first.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };

        let mut inner = self.lock();
        if !inner.entries.contains(&key) && inner.entries.len() >= self.capacity.get() {
            if inner.entries.pop_lru().is_some() {
                inner.evictions += 1;
            }
        }
        inner.entries.put(key, entry);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().entries.pop(key).map(|entry| entry.value)
    }

    /// Removes every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.pop(key);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    /// Shrinks the cache to `target_fraction` of its capacity
    ///
    /// Expired entries go first, then least-recently-used ones. Returns the
    /// number of entries removed.
    pub fn force_cleanup(&self, target_fraction: f64) -> usize {
        let target = (self.capacity.get() as f64 * target_fraction.clamp(0.0, 1.0)) as usize;
        let mut removed = self.purge_expired();

        let mut inner = self.lock();
        while inner.entries.len() > target {
            if inner.entries.pop_lru().is_none() {
                break;
            }
            inner.evictions += 1;
            removed += 1;
        }

        if removed > 0 {
            tracing::debug!(
                "Cache cleanup removed {} entries, {} remain",
                removed,
                inner.entries.len()
            );
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Number of stored entries, including ones that expired but were not yet purged
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            len: inner.entries.len(),
            capacity: self.capacity.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_after_set() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.set("a".to_string(), 1);

        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_entry_is_absent_and_purged() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.set_with_ttl("a", 1, Duration::from_millis(20));
        assert_eq!(cache.get(&"a"), Some(1));

        std::thread::sleep(Duration::from_millis(40));

        assert!(!cache.contains(&"a"));
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_evicts_least_recently_used_at_capacity() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);

        // touch "a" so "b" becomes the least recently used
        assert_eq!(cache.get(&"a"), Some(1));
        cache.set("c", 3);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), Some(2));
    }

    #[test]
    fn test_purge_expired_ignores_live_entries() {
        let cache = TtlCache::new(8, Duration::from_secs(60));
        cache.set_with_ttl("short", 1, Duration::from_millis(10));
        cache.set("long", 2);

        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&"long"));
    }

    #[test]
    fn test_force_cleanup_drops_oldest_to_target() {
        let cache = TtlCache::new(10, Duration::from_secs(60));
        for i in 0..10 {
            cache.set(i, i);
        }

        let removed = cache.force_cleanup(0.5);

        assert_eq!(removed, 5);
        assert_eq!(cache.len(), 5);
        for i in 0..5 {
            assert!(!cache.contains(&i));
        }
        for i in 5..10 {
            assert!(cache.contains(&i));
        }
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = TtlCache::new(0, Duration::from_secs(1));
        cache.set(1, 1);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }
}
