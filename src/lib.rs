//! Community-Harvester: a proxy-rotating, rate-aware harvester
//!
//! This crate continuously collects community metadata, posts and user profiles
//! from a public JSON API through a pool of egress proxies, pacing every request,
//! buffering results and persisting them through a circuit breaker.

pub mod cache;
pub mod client;
pub mod config;
pub mod control;
pub mod engine;
pub mod harvest;
pub mod lifecycle;
pub mod monitor;
pub mod proxy;
pub mod ratelimit;
pub mod resilience;
pub mod scheduler;
pub mod storage;
pub mod writer;

use std::time::Duration;
use thiserror::Error;

/// Main error type for harvester operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error for {target}: {message}")]
    Transport { target: String, message: String },

    #[error("Rate limited while fetching {target}")]
    RateLimited { target: String },

    #[error("Not found: {target} (banned: {banned})")]
    NotFound { target: String, banned: bool },

    #[error("Forbidden: {target}")]
    Forbidden { target: String },

    #[error("Item {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("Storage error: {0}")]
    Store(#[from] storage::StoreError),

    #[error("Circuit breaker is open, persistence call rejected")]
    CircuitOpen,

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected payload for {target}: {message}")]
    Payload { target: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl HarvestError {
    /// Returns true for outcomes that are final for an item and must not be retried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Forbidden { .. } | Self::Payload { .. }
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid value for environment variable {var}: {message}")]
    Environment { var: String, message: String },

    #[error("No usable proxy backends: {0}")]
    NoUsableProxies(String),
}

/// Result type alias for harvester operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use engine::Harvester;
pub use scheduler::{CycleStats, DiscoveryScheduler, Target};
