//! Sliding-window rate limiting per operation class
//!
//! Each class (reads, writes, destructive operations) has its own window and
//! cap. After the window admits a call, a permit is taken from a global
//! concurrency gate that may be shared between several limiters.

mod window;

pub use window::SlidingWindow;

use crate::config::RateLimitConfig;
use crate::HarvestError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Class of operation being throttled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Upstream fetches and store reads
    Read,
    /// Inserts and upserts
    Write,
    /// Deletes
    Destructive,
}

/// Cap for one operation class
#[derive(Debug, Clone, Copy)]
pub struct ClassLimit {
    pub cap: u32,
    pub window: Duration,
}

/// A held concurrency permit; dropping it releases the slot
#[derive(Debug)]
pub struct RatePermit {
    class: OpClass,
    _permit: OwnedSemaphorePermit,
}

impl RatePermit {
    pub fn class(&self) -> OpClass {
        self.class
    }

    /// Returns the permit to the global gate
    pub fn release(self) {}
}

/// Per-class sliding-window throttle plus a bounded concurrency gate
pub struct RateLimiter {
    windows: Mutex<HashMap<OpClass, SlidingWindow>>,
    gate: Arc<Semaphore>,
    min_wait: Duration,
    max_wait: Duration,
}

impl RateLimiter {
    /// Creates a limiter with its own windows and the given shared gate
    pub fn new(
        limits: &[(OpClass, ClassLimit)],
        gate: Arc<Semaphore>,
        min_wait: Duration,
        max_wait: Duration,
    ) -> Self {
        let windows = limits
            .iter()
            .map(|(class, limit)| (*class, SlidingWindow::new(limit.cap, limit.window)))
            .collect();

        Self {
            windows: Mutex::new(windows),
            gate,
            min_wait,
            max_wait: max_wait.max(min_wait),
        }
    }

    /// Builds a limiter from configuration around a shared gate
    pub fn from_config(config: &RateLimitConfig, gate: Arc<Semaphore>) -> Self {
        let window = Duration::from_secs(config.window_secs);
        Self::new(
            &[
                (OpClass::Read, ClassLimit { cap: config.read_cap, window }),
                (OpClass::Write, ClassLimit { cap: config.write_cap, window }),
                (
                    OpClass::Destructive,
                    ClassLimit {
                        cap: config.destructive_cap,
                        window,
                    },
                ),
            ],
            gate,
            Duration::from_millis(config.min_wait_ms),
            Duration::from_millis(config.max_wait_ms),
        )
    }

    /// Creates the global gate shared by all limiters of one engine
    pub fn shared_gate(max_concurrent: u32) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(max_concurrent.max(1) as usize))
    }

    /// Waits until `class` is under its cap, then takes a concurrency permit
    ///
    /// Classes without a configured limit are only gated on concurrency.
    pub async fn acquire(&self, class: OpClass) -> Result<RatePermit, HarvestError> {
        loop {
            let wait = {
                let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                match windows.get_mut(&class) {
                    None => break,
                    Some(window) => match window.wait_needed(now) {
                        None => {
                            window.record(now);
                            break;
                        }
                        Some(wait) => wait.clamp(self.min_wait, self.max_wait),
                    },
                }
            };

            tracing::trace!(?class, "Rate window full, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }

        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HarvestError::Task("rate limiter gate closed".to_string()))?;

        Ok(RatePermit {
            class,
            _permit: permit,
        })
    }

    /// Calls of `class` currently inside its window
    pub fn in_window(&self, class: OpClass) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .get_mut(&class)
            .map_or(0, |window| window.count(Instant::now()))
    }

    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }
}
