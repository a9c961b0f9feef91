//! Configuration module for the harvester
//!
//! This module handles loading, parsing, environment overrides and validation
//! of TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use community_harvester::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Proxies configured: {}", config.proxies.len());
//! ```

mod env;
mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BreakerConfig, CacheConfig, Config, ControlConfig, MemoryConfig, ProxyEntry,
    RateLimitConfig, RetryConfig, SchedulerConfig, StealthConfig, StorageConfig,
    UpstreamConfig, WorkerConfig, WriterConfig,
};

// Re-export parser functions
pub use env::{apply_env_overrides, apply_overrides_from, ENV_PREFIX};
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
