//! Environment overrides for numeric configuration knobs
//!
//! Every tunable number can be replaced at deploy time with a `HARVEST_*`
//! variable, e.g. `HARVEST_STEALTH_MIN_DELAY_MS=1500`. Overrides are applied
//! after the TOML file is parsed and before validation runs, so an override
//! that breaks an invariant is rejected like a bad file value.

use crate::config::types::Config;
use crate::ConfigError;
use std::str::FromStr;

/// Prefix shared by all override variables
pub const ENV_PREFIX: &str = "HARVEST_";

/// Applies overrides from the process environment
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

/// Applies overrides using `lookup` to resolve variable names
///
/// Split out from [`apply_env_overrides`] so tests do not mutate the process
/// environment.
pub fn apply_overrides_from<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Lookup { lookup };

    env.set(&mut config.workers.threads_per_proxy, "WORKERS_THREADS_PER_PROXY")?;
    env.set(&mut config.workers.session_max_requests, "WORKERS_SESSION_MAX_REQUESTS")?;
    env.set(&mut config.workers.request_timeout_secs, "WORKERS_REQUEST_TIMEOUT_SECS")?;
    env.set(&mut config.workers.item_timeout_secs, "WORKERS_ITEM_TIMEOUT_SECS")?;

    env.set(&mut config.retry.transport_retries, "RETRY_TRANSPORT_RETRIES")?;
    env.set(&mut config.retry.transport_base_delay_ms, "RETRY_TRANSPORT_BASE_DELAY_MS")?;
    env.set(&mut config.retry.rate_limit_retries, "RETRY_RATE_LIMIT_RETRIES")?;
    env.set(&mut config.retry.rate_limit_base_ms, "RETRY_RATE_LIMIT_BASE_MS")?;
    env.set(&mut config.retry.rate_limit_step_ms, "RETRY_RATE_LIMIT_STEP_MS")?;
    env.set(&mut config.retry.rate_limit_cap_ms, "RETRY_RATE_LIMIT_CAP_MS")?;

    env.set(&mut config.rate_limit.window_secs, "RATE_LIMIT_WINDOW_SECS")?;
    env.set(&mut config.rate_limit.read_cap, "RATE_LIMIT_READ_CAP")?;
    env.set(&mut config.rate_limit.write_cap, "RATE_LIMIT_WRITE_CAP")?;
    env.set(&mut config.rate_limit.destructive_cap, "RATE_LIMIT_DESTRUCTIVE_CAP")?;
    env.set(&mut config.rate_limit.max_concurrent, "RATE_LIMIT_MAX_CONCURRENT")?;

    env.set(&mut config.cache.community_ttl_secs, "CACHE_COMMUNITY_TTL_SECS")?;
    env.set(&mut config.cache.community_capacity, "CACHE_COMMUNITY_CAPACITY")?;
    env.set(&mut config.cache.processed_ttl_secs, "CACHE_PROCESSED_TTL_SECS")?;
    env.set(&mut config.cache.processed_capacity, "CACHE_PROCESSED_CAPACITY")?;
    env.set(&mut config.cache.sweep_interval_secs, "CACHE_SWEEP_INTERVAL_SECS")?;

    env.set(&mut config.writer.batch_size, "WRITER_BATCH_SIZE")?;
    env.set(&mut config.writer.chunk_size, "WRITER_CHUNK_SIZE")?;
    env.set(&mut config.writer.flush_interval_secs, "WRITER_FLUSH_INTERVAL_SECS")?;
    env.set(&mut config.writer.max_failed_backlog, "WRITER_MAX_FAILED_BACKLOG")?;
    env.set(&mut config.writer.max_buffered, "WRITER_MAX_BUFFERED")?;

    env.set(&mut config.breaker.failure_threshold, "BREAKER_FAILURE_THRESHOLD")?;
    env.set(&mut config.breaker.cooldown_secs, "BREAKER_COOLDOWN_SECS")?;

    env.set(&mut config.stealth.min_delay_ms, "STEALTH_MIN_DELAY_MS")?;
    env.set(&mut config.stealth.max_delay_ms, "STEALTH_MAX_DELAY_MS")?;
    env.set(&mut config.stealth.burst_pause_min_ms, "STEALTH_BURST_PAUSE_MIN_MS")?;
    env.set(&mut config.stealth.burst_pause_max_ms, "STEALTH_BURST_PAUSE_MAX_MS")?;
    env.set(&mut config.stealth.burst_every_min, "STEALTH_BURST_EVERY_MIN")?;
    env.set(&mut config.stealth.burst_every_max, "STEALTH_BURST_EVERY_MAX")?;

    env.set(&mut config.memory.warning_mb, "MEMORY_WARNING_MB")?;
    env.set(&mut config.memory.error_mb, "MEMORY_ERROR_MB")?;
    env.set(&mut config.memory.critical_mb, "MEMORY_CRITICAL_MB")?;
    env.set(&mut config.memory.check_interval_secs, "MEMORY_CHECK_INTERVAL_SECS")?;

    env.set(&mut config.scheduler.wave_two_cap, "SCHEDULER_WAVE_TWO_CAP")?;
    env.set(&mut config.scheduler.max_consecutive_errors, "SCHEDULER_MAX_CONSECUTIVE_ERRORS")?;
    env.set(&mut config.scheduler.unhealthy_threshold, "SCHEDULER_UNHEALTHY_THRESHOLD")?;
    env.set(&mut config.scheduler.cycle_pause_secs, "SCHEDULER_CYCLE_PAUSE_SECS")?;

    if let Some(path) = env.raw("CONTROL_FLAG_PATH") {
        config.control.flag_path = Some(path);
    }
    if let Some(path) = env.raw("STORAGE_DATABASE_PATH") {
        config.storage.database_path = path;
    }

    Ok(())
}

struct Lookup<F> {
    lookup: F,
}

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, suffix))
    }

    fn set<T>(&self, slot: &mut T, suffix: &str) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.raw(suffix) else {
            return Ok(());
        };

        *slot = value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Environment {
                var: format!("{}{}", ENV_PREFIX, suffix),
                message: format!("'{}': {}", value, e),
            })?;
        Ok(())
    }
}
