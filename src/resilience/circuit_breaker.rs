//! Circuit breaker guarding the persistence layer.
//!
//! # States
//! - Closed: normal operation, writes pass through
//! - Open: store assumed down, writes fail fast
//! - Half-Open: cooldown elapsed, the next write is let through as a probe
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold
//! Open → Half-Open: after cooldown
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open: probe fails (cooldown restarts)
//! ```

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    failure_count: u32,
    last_failure_time: Option<Instant>,
    is_open: bool,
}

/// Fail-fast wrapper state for a flaky downstream dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                failure_count: 0,
                last_failure_time: None,
                is_open: false,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if a call may proceed
    ///
    /// While open, calls are rejected until the cooldown since the last
    /// failure has elapsed; after that every call is allowed as a probe until
    /// one is recorded.
    pub fn should_allow(&self) -> bool {
        let inner = self.lock();
        if !inner.is_open {
            return true;
        }
        inner
            .last_failure_time
            .map_or(true, |at| at.elapsed() >= self.cooldown)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.is_open {
            tracing::info!("Circuit breaker closed after successful probe");
        }
        inner.failure_count = 0;
        inner.is_open = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());

        if inner.is_open {
            tracing::warn!(
                failures = inner.failure_count,
                "Circuit breaker probe failed, reopening for {:?}",
                self.cooldown
            );
        } else if inner.failure_count >= self.threshold {
            inner.is_open = true;
            tracing::error!(
                failures = inner.failure_count,
                "Circuit breaker opened, persistence paused for {:?}",
                self.cooldown
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match (inner.is_open, inner.last_failure_time) {
            (false, _) => BreakerState::Closed,
            (true, Some(at)) if at.elapsed() < self.cooldown => BreakerState::Open,
            (true, _) => BreakerState::HalfOpen,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }
}
