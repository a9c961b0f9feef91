//! In-memory caches with expiry
//!
//! - `TtlCache`: bounded key/value store with per-entry TTL and LRU eviction
//! - `TtlSet`: presence-only variant for "already processed" bookkeeping
//! - `spawn_sweeper`: background purge of expired entries

mod ttl_cache;
mod ttl_set;

pub use ttl_cache::{CacheStats, TtlCache};
pub use ttl_set::TtlSet;

use crate::lifecycle::BackgroundTask;
use std::sync::Arc;
use std::time::Duration;

/// Anything whose expired entries can be purged in bulk
pub trait Sweepable: Send + Sync {
    /// Drops expired entries and returns how many were removed
    fn sweep(&self) -> usize;

    /// Shrinks to `target_fraction` of capacity under memory pressure
    fn shrink(&self, target_fraction: f64) -> usize;
}

impl<K, V> Sweepable for TtlCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn sweep(&self) -> usize {
        self.purge_expired()
    }

    fn shrink(&self, target_fraction: f64) -> usize {
        self.force_cleanup(target_fraction)
    }
}

impl<K> Sweepable for TtlSet<K>
where
    K: std::hash::Hash + Eq + Clone + Send,
{
    fn sweep(&self) -> usize {
        self.purge_expired()
    }

    fn shrink(&self, target_fraction: f64) -> usize {
        self.force_cleanup(target_fraction)
    }
}

/// Spawns a task that purges expired entries from every cache each `interval`
///
/// Keys that are never queried again would otherwise stay resident until
/// evicted by capacity pressure.
pub fn spawn_sweeper(caches: Vec<Arc<dyn Sweepable>>, interval: Duration) -> BackgroundTask {
    BackgroundTask::every("cache-sweeper", interval, move || {
        let caches = caches.clone();
        async move {
            let purged: usize = caches.iter().map(|cache| cache.sweep()).sum();
            if purged > 0 {
                tracing::debug!("Cache sweep purged {} expired entries", purged);
            }
        }
    })
}
