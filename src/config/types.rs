use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure for the harvester
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub stealth: StealthConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub control: ControlConfig,
    pub storage: StorageConfig,
    #[serde(rename = "proxy", default)]
    pub proxies: Vec<ProxyEntry>,
}

/// Worker pool sizing and session limits
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerConfig {
    /// Worker slots given to a backend that does not declare its own quota
    pub threads_per_proxy: u32,

    /// Requests served by one HTTP session before it is rebuilt
    pub session_max_requests: u32,

    /// Timeout for a single HTTP request (seconds)
    pub request_timeout_secs: u64,

    /// Upper bound on the time one target may occupy a worker (seconds)
    pub item_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads_per_proxy: 3,
            session_max_requests: 200,
            request_timeout_secs: 30,
            item_timeout_secs: 180,
        }
    }
}

/// Upstream API location and client identities
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UpstreamConfig {
    /// Base URL of the JSON API
    pub base_url: String,

    /// Path fetched once per backend during the startup self-test
    pub probe_path: String,

    /// Pool of User-Agent strings rotated per request
    pub user_agents: Vec<String>,

    /// Number of posts requested per listing
    pub listing_limit: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.reddit.com".to_string(),
            probe_path: "/r/popular/about.json".to_string(),
            user_agents: Vec::new(),
            listing_limit: 50,
        }
    }
}

/// Retry budgets for transport failures and 429 responses
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    pub transport_retries: u32,
    pub transport_base_delay_ms: u64,
    pub rate_limit_retries: u32,
    pub rate_limit_base_ms: u64,
    pub rate_limit_step_ms: u64,
    pub rate_limit_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transport_retries: 3,
            transport_base_delay_ms: 1_000,
            rate_limit_retries: 3,
            rate_limit_base_ms: 5_000,
            rate_limit_step_ms: 5_000,
            rate_limit_cap_ms: 30_000,
        }
    }
}

/// Sliding-window caps per operation class
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub read_cap: u32,
    pub write_cap: u32,
    pub destructive_cap: u32,
    pub max_concurrent: u32,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            read_cap: 30,
            write_cap: 20,
            destructive_cap: 5,
            max_concurrent: 16,
            min_wait_ms: 50,
            max_wait_ms: 5_000,
        }
    }
}

/// TTL cache sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    pub community_ttl_secs: u64,
    pub community_capacity: usize,
    pub processed_ttl_secs: u64,
    pub processed_capacity: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            community_ttl_secs: 1_800,
            community_capacity: 2_000,
            processed_ttl_secs: 6 * 3_600,
            processed_capacity: 50_000,
            sweep_interval_secs: 300,
        }
    }
}

/// Buffered writer behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WriterConfig {
    /// Buffered records per collection that trigger an immediate flush
    pub batch_size: usize,

    /// Records per upsert call
    pub chunk_size: usize,

    /// Auto-flush interval (seconds)
    pub flush_interval_secs: u64,

    /// Records kept after failing individual retry
    pub max_failed_backlog: usize,

    /// Buffered records per collection before the oldest overflow into the failed backlog
    pub max_buffered: usize,

    /// Fields whose persisted value survives an upsert, per collection
    pub protected_fields: HashMap<String, Vec<String>>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        let mut protected_fields = HashMap::new();
        protected_fields.insert(
            "communities".to_string(),
            vec!["category".to_string(), "subcategory".to_string()],
        );
        Self {
            batch_size: 100,
            chunk_size: 50,
            flush_interval_secs: 30,
            max_failed_backlog: 1_000,
            max_buffered: 10_000,
            protected_fields,
        }
    }
}

/// Persistence circuit breaker
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

/// Inter-request pacing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StealthConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub burst_pause_min_ms: u64,
    pub burst_pause_max_ms: u64,
    pub burst_every_min: u32,
    pub burst_every_max: u32,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_delay_ms: 6_000,
            burst_pause_min_ms: 15_000,
            burst_pause_max_ms: 45_000,
            burst_every_min: 8,
            burst_every_max: 15,
        }
    }
}

/// Process memory thresholds (megabytes)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MemoryConfig {
    pub warning_mb: u64,
    pub error_mb: u64,
    pub critical_mb: u64,
    pub check_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_mb: 1_024,
            error_mb: 1_536,
            critical_mb: 2_048,
            check_interval_secs: 30,
        }
    }
}

/// Discovery cycle settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
    /// Wave-one community names
    pub seeds: Vec<String>,

    /// Maximum discovered targets promoted to wave two per cycle
    pub wave_two_cap: usize,

    /// Consecutive item failures across all workers that abort a cycle
    pub max_consecutive_errors: u32,

    /// Consecutive backend errors that deactivate a proxy
    pub unhealthy_threshold: u32,

    /// Pause between cycles (seconds)
    pub cycle_pause_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            wave_two_cap: 200,
            max_consecutive_errors: 25,
            unhealthy_threshold: 10,
            cycle_pause_secs: 300,
        }
    }
}

/// Location of the externally managed on/off flag
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ControlConfig {
    /// File whose content enables the harvester; when unset the harvester runs
    pub flag_path: Option<String>,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// One egress proxy backend
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyEntry {
    pub id: String,

    /// `host:port` of the proxy
    pub host: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Lower values are preferred
    #[serde(default)]
    pub priority: u32,

    /// Worker slots for this backend; falls back to `workers.threads-per-proxy`
    #[serde(default)]
    pub quota: Option<u32>,

    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl StealthConfig {
    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}
