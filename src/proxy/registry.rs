//! Proxy registry: backend ownership, slot assignment and health tracking
//!
//! The registry is the only owner of [`ProxyBackend`] state. Workers hold a
//! cloned [`ProxyConnection`] and report every outcome back here; stats are
//! mutated under a per-backend mutex that is never held across an await.

use crate::config::{Config, ProxyEntry};
use crate::proxy::backend::{ProxyBackend, ProxyConnection, ProxyStats};
use crate::ConfigError;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One concurrency unit bound to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlot {
    pub slot_id: usize,
    pub backend_id: String,
    /// Position of the backend in priority order; slots sharing a group share a proxy
    pub group: usize,
}

/// Point-in-time view of one backend
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub id: String,
    pub priority: u32,
    pub quota: u32,
    pub active: bool,
    pub stats: ProxyStats,
    pub health_score: f64,
}

/// Registry of egress proxy backends
pub struct ProxyRegistry {
    /// Sorted by priority, lowest first
    backends: Vec<Mutex<ProxyBackend>>,
    index: HashMap<String, usize>,
    assignments: Mutex<Vec<WorkerSlot>>,
    unhealthy_threshold: u32,
}

impl ProxyRegistry {
    /// Loads the active entries, ordered by priority
    ///
    /// # Arguments
    ///
    /// * `entries` - Configured proxies; inactive ones are skipped
    /// * `default_quota` - Slots for entries without an explicit quota
    /// * `unhealthy_threshold` - Consecutive errors that deactivate a backend
    ///
    /// # Returns
    ///
    /// * `Err(ConfigError::NoUsableProxies)` - No active entry was configured
    pub fn load(
        entries: &[ProxyEntry],
        default_quota: u32,
        unhealthy_threshold: u32,
    ) -> Result<Self, ConfigError> {
        let mut backends: Vec<ProxyBackend> = entries
            .iter()
            .filter(|e| e.active)
            .map(|e| ProxyBackend::from_entry(e, default_quota))
            .collect();

        if backends.is_empty() {
            return Err(ConfigError::NoUsableProxies(
                "no active proxy backends configured".to_string(),
            ));
        }

        // stable sort keeps file order among equal priorities
        backends.sort_by_key(|b| b.priority);

        let index = backends
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id().to_string(), i))
            .collect();

        info!("Loaded {} proxy backends", backends.len());

        Ok(Self {
            backends: backends.into_iter().map(Mutex::new).collect(),
            index,
            assignments: Mutex::new(Vec::new()),
            unhealthy_threshold,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::load(
            &config.proxies,
            config.workers.threads_per_proxy,
            config.scheduler.unhealthy_threshold,
        )
    }

    fn backend(&self, idx: usize) -> MutexGuard<'_, ProxyBackend> {
        self.backends[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_assignments(&self) -> MutexGuard<'_, Vec<WorkerSlot>> {
        self.assignments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Maps up to `n` worker slots onto active backends
    ///
    /// Backends are visited in priority order and each receives up to its
    /// quota, so higher-priority backends own the lowest slot ids. When the
    /// combined quota is smaller than `n`, fewer slots are returned.
    pub fn assign_slots(&self, n: usize) -> Vec<WorkerSlot> {
        let mut slots = Vec::with_capacity(n);

        for (group, cell) in self.backends.iter().enumerate() {
            if slots.len() >= n {
                break;
            }
            let backend = cell.lock().unwrap_or_else(|p| p.into_inner());
            if !backend.active {
                continue;
            }
            let take = (backend.quota as usize).min(n - slots.len());
            for _ in 0..take {
                slots.push(WorkerSlot {
                    slot_id: slots.len(),
                    backend_id: backend.id().to_string(),
                    group,
                });
            }
        }

        if slots.len() < n {
            warn!(
                "Requested {} worker slots but active backend quotas allow only {}",
                n,
                slots.len()
            );
        }

        *self.lock_assignments() = slots.clone();
        slots
    }

    /// Total slots the active backends can serve
    pub fn total_quota(&self) -> usize {
        (0..self.backends.len())
            .map(|i| self.backend(i))
            .filter(|b| b.active)
            .map(|b| b.quota as usize)
            .sum()
    }

    /// Connection parameters of the backend bound to `slot_id` in the last assignment
    pub fn get_backend(&self, slot_id: usize) -> Option<ProxyConnection> {
        let backend_id = self
            .lock_assignments()
            .iter()
            .find(|s| s.slot_id == slot_id)
            .map(|s| s.backend_id.clone())?;
        self.connection(&backend_id)
    }

    /// Connection parameters of a backend by id
    pub fn connection(&self, backend_id: &str) -> Option<ProxyConnection> {
        let idx = *self.index.get(backend_id)?;
        Some(self.backend(idx).connection.clone())
    }

    /// Records one request outcome
    ///
    /// Returns true when this outcome pushed the backend over the unhealthy
    /// threshold and deactivated it.
    pub fn report_outcome(
        &self,
        backend_id: &str,
        success: bool,
        latency: Duration,
        error: Option<&str>,
    ) -> bool {
        let Some(&idx) = self.index.get(backend_id) else {
            warn!("Outcome reported for unknown proxy backend '{}'", backend_id);
            return false;
        };

        let mut backend = self.backend(idx);
        backend.stats.record(success, latency, error);

        if backend.active && backend.stats.consecutive_errors >= self.unhealthy_threshold {
            backend.active = false;
            warn!(
                "Proxy backend '{}' disabled after {} consecutive errors (last: {})",
                backend_id,
                backend.stats.consecutive_errors,
                backend.stats.last_error.as_deref().unwrap_or("unknown")
            );
            return true;
        }
        false
    }

    /// Deactivates every backend whose consecutive errors reached `threshold`
    ///
    /// Returns the ids that were deactivated by this call.
    pub fn disable_if_unhealthy(&self, threshold: u32) -> Vec<String> {
        let mut disabled = Vec::new();
        for i in 0..self.backends.len() {
            let mut backend = self.backend(i);
            if backend.active && backend.stats.consecutive_errors >= threshold {
                backend.active = false;
                warn!(
                    "Proxy backend '{}' disabled ({} consecutive errors)",
                    backend.id(),
                    backend.stats.consecutive_errors
                );
                disabled.push(backend.id().to_string());
            }
        }
        disabled
    }

    /// Re-enables a backend and clears its error streak
    pub fn reactivate(&self, backend_id: &str) -> bool {
        let Some(&idx) = self.index.get(backend_id) else {
            return false;
        };
        let mut backend = self.backend(idx);
        backend.active = true;
        backend.stats.consecutive_errors = 0;
        info!("Proxy backend '{}' reactivated", backend_id);
        true
    }

    pub fn is_active(&self, backend_id: &str) -> bool {
        self.index
            .get(backend_id)
            .map(|&idx| self.backend(idx).active)
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        (0..self.backends.len())
            .filter(|&i| self.backend(i).active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Keeps only the slots whose backend is still active
    pub fn active_slots(&self, slots: &[WorkerSlot]) -> Vec<WorkerSlot> {
        slots
            .iter()
            .filter(|s| self.is_active(&s.backend_id))
            .cloned()
            .collect()
    }

    /// Per-backend stats in priority order
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        (0..self.backends.len())
            .map(|i| {
                let b = self.backend(i);
                BackendSnapshot {
                    id: b.id().to_string(),
                    priority: b.priority,
                    quota: b.quota,
                    active: b.active,
                    stats: b.stats.clone(),
                    health_score: b.stats.health_score(),
                }
            })
            .collect()
    }

    /// Probes every active backend once, concurrently
    ///
    /// Backends that fail the probe are deactivated. If none passes the
    /// harvester must not start, because it never sends unproxied traffic.
    ///
    /// # Returns
    ///
    /// * `Ok(n)` - Number of backends that passed
    /// * `Err(ConfigError::NoUsableProxies)` - Every probe failed
    pub async fn self_test<F, Fut>(&self, probe: F) -> Result<usize, ConfigError>
    where
        F: Fn(ProxyConnection) -> Fut,
        Fut: Future<Output = Result<Duration, String>>,
    {
        let candidates: Vec<ProxyConnection> = (0..self.backends.len())
            .filter_map(|i| {
                let b = self.backend(i);
                b.active.then(|| b.connection.clone())
            })
            .collect();

        let results = join_all(candidates.iter().cloned().map(&probe)).await;

        let mut passed = 0;
        for (conn, result) in candidates.iter().zip(results) {
            match result {
                Ok(latency) => {
                    passed += 1;
                    self.report_outcome(&conn.id, true, latency, None);
                    info!("Proxy backend '{}' passed self-test in {:?}", conn.id, latency);
                }
                Err(e) => {
                    self.report_outcome(&conn.id, false, Duration::ZERO, Some(&e));
                    if let Some(&idx) = self.index.get(&conn.id) {
                        self.backend(idx).active = false;
                    }
                    warn!("Proxy backend '{}' failed self-test: {}", conn.id, e);
                }
            }
        }

        if passed == 0 {
            return Err(ConfigError::NoUsableProxies(format!(
                "all {} backends failed the startup self-test",
                candidates.len()
            )));
        }

        Ok(passed)
    }

    /// Probes every deactivated backend and reactivates those that answer
    ///
    /// Returns the ids brought back.
    pub async fn reprobe_inactive<F, Fut>(&self, probe: F) -> Vec<String>
    where
        F: Fn(ProxyConnection) -> Fut,
        Fut: Future<Output = Result<Duration, String>>,
    {
        let candidates: Vec<ProxyConnection> = (0..self.backends.len())
            .filter_map(|i| {
                let b = self.backend(i);
                (!b.active).then(|| b.connection.clone())
            })
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let results = join_all(candidates.iter().cloned().map(&probe)).await;

        let mut revived = Vec::new();
        for (conn, result) in candidates.iter().zip(results) {
            match result {
                Ok(latency) => {
                    self.reactivate(&conn.id);
                    self.report_outcome(&conn.id, true, latency, None);
                    revived.push(conn.id.clone());
                }
                Err(e) => debug!("Proxy backend '{}' still failing: {}", conn.id, e),
            }
        }
        revived
    }
}
