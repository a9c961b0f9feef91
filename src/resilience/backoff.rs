//! Retry delay schedules.
//!
//! Two independent budgets: generic transport retries grow linearly from a
//! base, 429 responses use their own capped incremental schedule.

use crate::config::RetryConfig;
use std::time::Duration;

/// Delay before transport retry number `attempt` (1-based): `base * attempt`
pub fn transport_delay(attempt: u32, base_ms: u64) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(attempt as u64))
}

/// Delay before 429 retry number `attempt` (1-based): `min(base + attempt*step, cap)`
pub fn rate_limit_delay(attempt: u32, base_ms: u64, step_ms: u64, cap_ms: u64) -> Duration {
    let delay = base_ms.saturating_add(step_ms.saturating_mul(attempt as u64));
    Duration::from_millis(delay.min(cap_ms))
}

/// Retry budgets resolved from configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub transport_retries: u32,
    pub transport_base_ms: u64,
    pub rate_limit_retries: u32,
    pub rate_limit_base_ms: u64,
    pub rate_limit_step_ms: u64,
    pub rate_limit_cap_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            transport_retries: config.transport_retries,
            transport_base_ms: config.transport_base_delay_ms,
            rate_limit_retries: config.rate_limit_retries,
            rate_limit_base_ms: config.rate_limit_base_ms,
            rate_limit_step_ms: config.rate_limit_step_ms,
            rate_limit_cap_ms: config.rate_limit_cap_ms,
        }
    }

    pub fn transport_delay(&self, attempt: u32) -> Duration {
        transport_delay(attempt, self.transport_base_ms)
    }

    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        rate_limit_delay(
            attempt,
            self.rate_limit_base_ms,
            self.rate_limit_step_ms,
            self.rate_limit_cap_ms,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
