//! HTTP session construction
//!
//! Every session is bound to exactly one proxy backend. There is no builder
//! for a direct connection.

use crate::proxy::ProxyConnection;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Builds a fresh session for a backend; called again on every recycle
pub type SessionFactory = Arc<dyn Fn(&ProxyConnection) -> reqwest::Result<Client> + Send + Sync>;

/// Builds an HTTP client that routes all traffic through `conn`
///
/// # Arguments
///
/// * `conn` - The proxy backend the session is bound to
/// * `timeout` - Timeout for a whole request
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Invalid proxy parameters
pub fn build_session(conn: &ProxyConnection, timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .proxy(conn.to_reqwest()?)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .pool_max_idle_per_host(2)
        .gzip(true)
        .brotli(true)
        .build()
}

/// Factory producing proxied sessions with the given request timeout
pub fn proxied_factory(timeout: Duration) -> SessionFactory {
    Arc::new(move |conn: &ProxyConnection| build_session(conn, timeout))
}
