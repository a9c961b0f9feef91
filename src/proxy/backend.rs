//! Proxy backend abstraction.
//!
//! # Responsibilities
//! - Hold the immutable connection parameters of one egress proxy
//! - Track rolling request statistics and a derived health score
//! - Carry the active flag the registry flips when a backend turns unhealthy

use crate::config::ProxyEntry;
use std::time::Duration;

/// Immutable connection parameters of one proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConnection {
    pub id: String,
    /// `host:port`
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConnection {
    pub fn from_entry(entry: &ProxyEntry) -> Self {
        Self {
            id: entry.id.clone(),
            host: entry.host.clone(),
            username: entry.username.clone(),
            password: entry.password.clone(),
        }
    }

    /// Proxy URL without credentials
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.host)
    }

    /// Builds the reqwest proxy that routes every scheme through this backend
    pub fn to_reqwest(&self) -> reqwest::Result<reqwest::Proxy> {
        let proxy = reqwest::Proxy::all(self.proxy_url())?;
        Ok(match (&self.username, &self.password) {
            (Some(user), Some(pass)) => proxy.basic_auth(user, pass),
            _ => proxy,
        })
    }
}

/// Rolling statistics for one backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyStats {
    pub requests: u64,
    pub successes: u64,
    pub consecutive_errors: u32,
    pub avg_latency_ms: f64,
    pub last_error: Option<String>,
}

impl ProxyStats {
    /// Records one request outcome
    pub fn record(&mut self, success: bool, latency: Duration, error: Option<&str>) {
        self.requests += 1;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.requests as f64;

        if success {
            self.successes += 1;
            self.consecutive_errors = 0;
        } else {
            self.consecutive_errors += 1;
            self.last_error = error.map(str::to_string);
        }
    }

    /// Fraction of successful requests; 1.0 before the first request
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }

    /// `success_rate*100 - avg_latency_ms/100 - consecutive_errors*10`
    pub fn health_score(&self) -> f64 {
        self.success_rate() * 100.0
            - self.avg_latency_ms / 100.0
            - self.consecutive_errors as f64 * 10.0
    }
}

/// A proxy backend as tracked by the registry
#[derive(Debug, Clone)]
pub struct ProxyBackend {
    pub connection: ProxyConnection,
    /// Lower values are preferred
    pub priority: u32,
    /// Worker slots this backend may serve
    pub quota: u32,
    pub active: bool,
    pub stats: ProxyStats,
}

impl ProxyBackend {
    pub fn from_entry(entry: &ProxyEntry, default_quota: u32) -> Self {
        Self {
            connection: ProxyConnection::from_entry(entry),
            priority: entry.priority,
            quota: entry.quota.unwrap_or(default_quota),
            active: entry.active,
            stats: ProxyStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.connection.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_score_formula() {
        let mut stats = ProxyStats::default();
        assert_eq!(stats.health_score(), 100.0);

        stats.record(true, Duration::from_millis(200), None);
        stats.record(false, Duration::from_millis(400), Some("timeout"));

        // 50% success, 300ms average, one consecutive error
        assert!((stats.health_score() - (50.0 - 3.0 - 10.0)).abs() < 1e-9);
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_success_resets_consecutive_errors() {
        let mut stats = ProxyStats::default();
        stats.record(false, Duration::ZERO, Some("boom"));
        stats.record(false, Duration::ZERO, Some("boom"));
        assert_eq!(stats.consecutive_errors, 2);

        stats.record(true, Duration::ZERO, None);
        assert_eq!(stats.consecutive_errors, 0);
        assert_eq!(stats.requests, 3);
    }

    #[test]
    fn test_proxy_url_excludes_credentials() {
        let conn = ProxyConnection {
            id: "a".to_string(),
            host: "10.0.0.1:3128".to_string(),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
        };
        assert_eq!(conn.proxy_url(), "http://10.0.0.1:3128");
        assert!(conn.to_reqwest().is_ok());
    }
}
