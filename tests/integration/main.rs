//! Integration tests for the harvester
//!
//! These tests use wiremock to stand in for the upstream API. Sessions are
//! built without a proxy so requests reach the mock server directly; each
//! session is still bound to a registry backend for stats and recycling.

mod cycle_tests;
mod worker_tests;
mod writer_tests;

use community_harvester::client::{SessionFactory, WorkerClient};
use community_harvester::config::Config;
use community_harvester::proxy::{ProxyConnection, ProxyRegistry};
use community_harvester::ratelimit::RateLimiter;
use std::sync::Arc;
use std::time::Duration;

/// Creates a test configuration pointed at `base_url` with fast pacing
pub fn create_test_config(base_url: &str) -> Config {
    let mut config: Config = toml::from_str(&format!(
        r#"
        [upstream]
        base-url = "{}"
        listing-limit = 25

        [workers]
        request-timeout-secs = 5
        item-timeout-secs = 30

        [retry]
        transport-retries = 2
        transport-base-delay-ms = 10
        rate-limit-retries = 3
        rate-limit-base-ms = 10
        rate-limit-step-ms = 10
        rate-limit-cap-ms = 1000

        [rate-limit]
        window-secs = 1
        read-cap = 1000
        write-cap = 500
        min-wait-ms = 1
        max-wait-ms = 50

        [stealth]
        min-delay-ms = 1
        max-delay-ms = 2
        burst-pause-min-ms = 1
        burst-pause-max-ms = 2

        [storage]
        database-path = ":memory:"

        [[proxy]]
        id = "a"
        host = "127.0.0.1:9"
        quota = 2
        "#,
        base_url
    ))
    .expect("test config parses");
    config.memory.check_interval_secs = 3_600;
    config
}

/// Session factory that skips the proxy and talks to the mock server
pub fn direct_factory() -> SessionFactory {
    Arc::new(|_conn: &ProxyConnection| {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
    })
}

/// Builds a worker on the first slot of a fresh registry
pub fn build_worker(config: &Config, factory: SessionFactory) -> (WorkerClient, Arc<ProxyRegistry>) {
    let registry = Arc::new(ProxyRegistry::from_config(config).unwrap());
    let slot = registry.assign_slots(1).remove(0);
    let limiter = RateLimiter::from_config(
        &config.rate_limit,
        RateLimiter::shared_gate(config.rate_limit.max_concurrent),
    );
    let worker = WorkerClient::with_session_factory(
        slot,
        Arc::clone(&registry),
        limiter,
        config,
        factory,
    )
    .unwrap();
    (worker, registry)
}
