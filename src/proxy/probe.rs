//! Health probe used by the registry self-test and re-probing

use crate::client::SessionFactory;
use crate::proxy::ProxyConnection;
use reqwest::header::USER_AGENT;
use std::time::{Duration, Instant};

/// Fetches `url` once through a session built by `factory` for `conn`
///
/// # Returns
///
/// * `Ok(latency)` - The backend answered with a 2xx status
/// * `Err(message)` - Session, transport or non-success status failure
pub async fn probe_with(
    factory: SessionFactory,
    conn: ProxyConnection,
    url: String,
    user_agent: String,
) -> Result<Duration, String> {
    let session = factory(&conn).map_err(|e| e.to_string())?;
    let started = Instant::now();

    let response = session
        .get(&url)
        .header(USER_AGENT, user_agent)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(started.elapsed())
    } else {
        Err(format!("probe returned HTTP {}", response.status().as_u16()))
    }
}
