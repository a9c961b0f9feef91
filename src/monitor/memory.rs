//! Process memory monitor
//!
//! # Levels
//! - **Normal**: below the warning threshold
//! - **Warning**: logged at info
//! - **Error**: logged at warn
//! - **Critical**: logged at error; every registered cleanup callback runs and
//!   memory is sampled again to confirm it went down

use crate::config::MemoryConfig;
use crate::lifecycle::BackgroundTask;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sysinfo::{Pid, System};
use tracing::{debug, error, info, warn};

const MB: u64 = 1024 * 1024;

/// Source of resident-memory readings
pub trait MemorySampler: Send + Sync {
    /// Resident set size in bytes, or None when it cannot be read
    fn resident_bytes(&self) -> Option<u64>;
}

/// Samples the current process through `sysinfo`
pub struct ProcessSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot determine own pid, memory sampling disabled: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessSampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_process(pid);
        system.process(pid).map(|p| p.memory())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryLevel {
    Normal,
    Warning,
    Error,
    Critical,
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryReport {
    pub level: MemoryLevel,
    pub resident_mb: f64,
    /// Items released by cleanup callbacks (critical only)
    pub released: usize,
    /// Re-sampled usage after cleanup (critical only)
    pub after_cleanup_mb: Option<f64>,
}

type CleanupFn = Box<dyn Fn() -> usize + Send + Sync>;

pub struct MemoryMonitor {
    sampler: Arc<dyn MemorySampler>,
    warning_bytes: u64,
    error_bytes: u64,
    critical_bytes: u64,
    callbacks: Mutex<Vec<(String, CleanupFn)>>,
}

impl MemoryMonitor {
    pub fn new(sampler: Arc<dyn MemorySampler>, config: &MemoryConfig) -> Self {
        Self {
            sampler,
            warning_bytes: config.warning_mb.saturating_mul(MB),
            error_bytes: config.error_mb.saturating_mul(MB),
            critical_bytes: config.critical_mb.saturating_mul(MB),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Vec<(String, CleanupFn)>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a callback that releases memory and returns how many items it dropped
    pub fn register_cleanup<F>(&self, name: &str, callback: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.lock_callbacks()
            .push((name.to_string(), Box::new(callback)));
    }

    pub fn classify(&self, bytes: u64) -> MemoryLevel {
        if bytes >= self.critical_bytes {
            MemoryLevel::Critical
        } else if bytes >= self.error_bytes {
            MemoryLevel::Error
        } else if bytes >= self.warning_bytes {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    /// Runs every cleanup callback; returns the total items released
    pub fn run_cleanup(&self) -> usize {
        let callbacks = self.lock_callbacks();
        let mut total = 0;
        for (name, callback) in callbacks.iter() {
            let released = callback();
            debug!("Memory cleanup '{}' released {} items", name, released);
            total += released;
        }
        total
    }

    /// Samples memory once and reacts to the level
    ///
    /// Returns None when the sampler cannot read memory.
    pub fn check(&self) -> Option<MemoryReport> {
        let bytes = self.sampler.resident_bytes()?;
        let level = self.classify(bytes);
        let resident_mb = bytes as f64 / MB as f64;

        let mut report = MemoryReport {
            level,
            resident_mb,
            released: 0,
            after_cleanup_mb: None,
        };

        match level {
            MemoryLevel::Normal => debug!("Memory usage {:.1} MB", resident_mb),
            MemoryLevel::Warning => info!("Memory usage {:.1} MB above warning threshold", resident_mb),
            MemoryLevel::Error => warn!("Memory usage {:.1} MB above error threshold", resident_mb),
            MemoryLevel::Critical => {
                error!(
                    "Memory usage {:.1} MB is critical, running cleanup",
                    resident_mb
                );
                report.released = self.run_cleanup();

                if let Some(after) = self.sampler.resident_bytes() {
                    let after_mb = after as f64 / MB as f64;
                    report.after_cleanup_mb = Some(after_mb);
                    if self.classify(after) == MemoryLevel::Critical {
                        error!(
                            "Memory still critical after cleanup: {:.1} MB ({} items released)",
                            after_mb, report.released
                        );
                    } else {
                        info!(
                            "Cleanup released {} items, memory now {:.1} MB",
                            report.released, after_mb
                        );
                    }
                }
            }
        }

        Some(report)
    }

    /// Starts periodic sampling
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> BackgroundTask {
        let monitor = Arc::clone(self);
        BackgroundTask::every("memory-monitor", interval, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.check();
            }
        })
    }
}
