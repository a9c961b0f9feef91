use crate::config::types::{
    BreakerConfig, Config, MemoryConfig, ProxyEntry, RateLimitConfig, RetryConfig,
    StealthConfig, UpstreamConfig, WorkerConfig, WriterConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_worker_config(&config.workers)?;
    validate_upstream_config(&config.upstream)?;
    validate_retry_config(&config.retry)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_writer_config(&config.writer)?;
    validate_breaker_config(&config.breaker)?;
    validate_stealth_config(&config.stealth)?;
    validate_memory_config(&config.memory)?;
    validate_proxies(&config.proxies)?;

    if config.storage.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_worker_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.threads_per_proxy < 1 || config.threads_per_proxy > 32 {
        return Err(ConfigError::Validation(format!(
            "threads_per_proxy must be between 1 and 32, got {}",
            config.threads_per_proxy
        )));
    }

    if config.session_max_requests < 1 {
        return Err(ConfigError::Validation(
            "session_max_requests must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_secs < 1 || config.item_timeout_secs < config.request_timeout_secs
    {
        return Err(ConfigError::Validation(format!(
            "item_timeout_secs ({}) must be >= request_timeout_secs ({}) >= 1",
            config.item_timeout_secs, config.request_timeout_secs
        )));
    }

    Ok(())
}

fn validate_upstream_config(config: &UpstreamConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base_url: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "base_url must be http(s), got '{}'",
            config.base_url
        )));
    }

    if !config.probe_path.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "probe_path must start with '/', got '{}'",
            config.probe_path
        )));
    }

    if config.listing_limit < 1 || config.listing_limit > 100 {
        return Err(ConfigError::Validation(format!(
            "listing_limit must be between 1 and 100, got {}",
            config.listing_limit
        )));
    }

    if config.user_agents.iter().any(|ua| ua.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "user_agents cannot contain empty entries".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.transport_retries > 10 || config.rate_limit_retries > 10 {
        return Err(ConfigError::Validation(format!(
            "retry counts must be <= 10, got transport={} rate_limit={}",
            config.transport_retries, config.rate_limit_retries
        )));
    }

    if config.rate_limit_step_ms < 1 {
        return Err(ConfigError::Validation(
            "rate_limit_step_ms must be >= 1".to_string(),
        ));
    }

    // the last 429 delay may not reach past the cap
    let growth = config
        .rate_limit_step_ms
        .saturating_mul(config.rate_limit_retries as u64);
    let last_delay = config.rate_limit_base_ms.saturating_add(growth);
    if last_delay > config.rate_limit_cap_ms {
        return Err(ConfigError::Validation(format!(
            "rate_limit_cap_ms ({}) must be >= rate_limit_base_ms + rate_limit_retries * rate_limit_step_ms ({})",
            config.rate_limit_cap_ms, last_delay
        )));
    }

    Ok(())
}

fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.window_secs < 1 {
        return Err(ConfigError::Validation(
            "rate limit window_secs must be >= 1".to_string(),
        ));
    }

    for (name, cap) in [
        ("read_cap", config.read_cap),
        ("write_cap", config.write_cap),
        ("destructive_cap", config.destructive_cap),
        ("max_concurrent", config.max_concurrent),
    ] {
        if cap < 1 {
            return Err(ConfigError::Validation(format!(
                "{} must be >= 1, got {}",
                name, cap
            )));
        }
    }

    if !(config.read_cap > config.write_cap && config.write_cap > config.destructive_cap) {
        return Err(ConfigError::Validation(format!(
            "rate limit caps must descend: read_cap ({}) > write_cap ({}) > destructive_cap ({})",
            config.read_cap, config.write_cap, config.destructive_cap
        )));
    }

    if config.min_wait_ms >= config.max_wait_ms {
        return Err(ConfigError::Validation(format!(
            "min_wait_ms ({}) must be < max_wait_ms ({})",
            config.min_wait_ms, config.max_wait_ms
        )));
    }

    Ok(())
}

fn validate_writer_config(config: &WriterConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 || config.chunk_size < 1 {
        return Err(ConfigError::Validation(format!(
            "batch_size and chunk_size must be >= 1, got {} and {}",
            config.batch_size, config.chunk_size
        )));
    }

    if config.flush_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "flush_interval_secs must be >= 1".to_string(),
        ));
    }

    if config.max_buffered < config.batch_size {
        return Err(ConfigError::Validation(format!(
            "max_buffered ({}) must hold at least one batch ({})",
            config.max_buffered, config.batch_size
        )));
    }

    Ok(())
}

fn validate_breaker_config(config: &BreakerConfig) -> Result<(), ConfigError> {
    if config.failure_threshold < 1 {
        return Err(ConfigError::Validation(
            "failure_threshold must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_stealth_config(config: &StealthConfig) -> Result<(), ConfigError> {
    if config.min_delay_ms >= config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "min_delay_ms ({}) must be < max_delay_ms ({})",
            config.min_delay_ms, config.max_delay_ms
        )));
    }

    if config.burst_pause_min_ms > config.burst_pause_max_ms {
        return Err(ConfigError::Validation(format!(
            "burst_pause_min_ms ({}) must be <= burst_pause_max_ms ({})",
            config.burst_pause_min_ms, config.burst_pause_max_ms
        )));
    }

    if config.burst_every_min < 1 || config.burst_every_min > config.burst_every_max {
        return Err(ConfigError::Validation(format!(
            "burst interval must satisfy 1 <= burst_every_min ({}) <= burst_every_max ({})",
            config.burst_every_min, config.burst_every_max
        )));
    }

    Ok(())
}

fn validate_memory_config(config: &MemoryConfig) -> Result<(), ConfigError> {
    if !(config.warning_mb < config.error_mb && config.error_mb < config.critical_mb) {
        return Err(ConfigError::Validation(format!(
            "memory thresholds must ascend: warning ({}) < error ({}) < critical ({})",
            config.warning_mb, config.error_mb, config.critical_mb
        )));
    }

    if config.check_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "memory check_interval_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates proxy entries
///
/// At least one active proxy is required: the harvester never sends traffic
/// without one.
fn validate_proxies(proxies: &[ProxyEntry]) -> Result<(), ConfigError> {
    if !proxies.iter().any(|p| p.active) {
        return Err(ConfigError::NoUsableProxies(
            "configuration declares no active [[proxy]] entries".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for proxy in proxies {
        if proxy.id.is_empty() {
            return Err(ConfigError::Validation(
                "proxy id cannot be empty".to_string(),
            ));
        }

        if !seen.insert(proxy.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate proxy id '{}'",
                proxy.id
            )));
        }

        validate_proxy_host(&proxy.host)?;

        if proxy.username.is_some() != proxy.password.is_some() {
            return Err(ConfigError::Validation(format!(
                "proxy '{}' must set both username and password or neither",
                proxy.id
            )));
        }

        if proxy.quota == Some(0) {
            return Err(ConfigError::Validation(format!(
                "proxy '{}' quota must be >= 1",
                proxy.id
            )));
        }
    }

    Ok(())
}

/// Validates a `host:port` proxy address
fn validate_proxy_host(host: &str) -> Result<(), ConfigError> {
    let Some((name, port)) = host.rsplit_once(':') else {
        return Err(ConfigError::Validation(format!(
            "proxy host '{}' must be in host:port form",
            host
        )));
    };

    if name.is_empty() {
        return Err(ConfigError::Validation(format!(
            "proxy host '{}' is missing a hostname",
            host
        )));
    }

    port.parse::<u16>().map_err(|_| {
        ConfigError::Validation(format!("proxy host '{}' has an invalid port", host))
    })?;

    Ok(())
}
