//! Per-slot worker client
//!
//! A [`WorkerClient`] owns one HTTP session bound to one proxy backend and its
//! own read-class rate limiter. Sessions are rebuilt after a fixed number of
//! requests, always through the same backend.
//!
//! # Response classification
//!
//! | Condition | Outcome | Retried |
//! |-----------|---------|---------|
//! | 2xx with JSON body | `Ok(payload)` | - |
//! | 404 | `NotFound { banned }` | never |
//! | 403 | `Forbidden { reason }` | never |
//! | 429 | `RateLimited` | own budget, `min(base + attempt*step, cap)` |
//! | 5xx, transport error, bad JSON | `TransportError` | `base * attempt` |
//! | other status | `TransportError` | never |

use crate::client::identity::IdentityPool;
use crate::client::operation::FetchOperation;
use crate::client::session::{proxied_factory, SessionFactory};
use crate::config::Config;
use crate::proxy::{ProxyConnection, ProxyRegistry, WorkerSlot};
use crate::ratelimit::{OpClass, RateLimiter};
use crate::resilience::RetryPolicy;
use crate::{ConfigError, HarvestError};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Semantic result of one fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ok(Value),
    NotFound { banned: bool },
    Forbidden { reason: Option<String> },
    RateLimited,
    TransportError(String),
}

impl FetchOutcome {
    /// Converts a non-payload outcome into the matching error for `target`
    pub fn into_result(self, target: &str) -> Result<Value, HarvestError> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::NotFound { banned } => Err(HarvestError::NotFound {
                target: target.to_string(),
                banned,
            }),
            Self::Forbidden { .. } => Err(HarvestError::Forbidden {
                target: target.to_string(),
            }),
            Self::RateLimited => Err(HarvestError::RateLimited {
                target: target.to_string(),
            }),
            Self::TransportError(message) => Err(HarvestError::Transport {
                target: target.to_string(),
                message,
            }),
        }
    }
}

/// What the retry loop does after one attempt
enum Verdict {
    Done(FetchOutcome),
    RetryTransport(String),
    RetryRateLimit,
}

/// HTTP client for one worker slot
pub struct WorkerClient {
    slot: WorkerSlot,
    connection: ProxyConnection,
    registry: Arc<ProxyRegistry>,
    limiter: RateLimiter,
    factory: SessionFactory,
    session: Client,
    session_requests: u32,
    session_max_requests: u32,
    sessions_built: u32,
    force_recycle: bool,
    base_url: String,
    identities: IdentityPool,
    retry: RetryPolicy,
    last_retry_delays: Vec<Duration>,
}

impl WorkerClient {
    /// Creates a client whose sessions go through the slot's proxy backend
    pub fn new(
        slot: WorkerSlot,
        registry: Arc<ProxyRegistry>,
        limiter: RateLimiter,
        config: &Config,
    ) -> Result<Self, HarvestError> {
        let factory = proxied_factory(Duration::from_secs(config.workers.request_timeout_secs));
        Self::with_session_factory(slot, registry, limiter, config, factory)
    }

    /// Creates a client with a custom session factory
    ///
    /// The factory is still handed the slot's backend on every rebuild.
    pub fn with_session_factory(
        slot: WorkerSlot,
        registry: Arc<ProxyRegistry>,
        limiter: RateLimiter,
        config: &Config,
        factory: SessionFactory,
    ) -> Result<Self, HarvestError> {
        let connection = registry
            .get_backend(slot.slot_id)
            .filter(|conn| conn.id == slot.backend_id)
            .ok_or_else(|| {
                ConfigError::NoUsableProxies(format!(
                    "slot {} is not assigned to backend '{}'",
                    slot.slot_id, slot.backend_id
                ))
            })?;
        let session = factory(&connection)?;

        Ok(Self {
            slot,
            connection,
            registry,
            limiter,
            factory,
            session,
            session_requests: 0,
            session_max_requests: config.workers.session_max_requests.max(1),
            sessions_built: 1,
            force_recycle: false,
            base_url: config.upstream.base_url.trim_end_matches('/').to_string(),
            identities: IdentityPool::from_config(&config.upstream),
            retry: RetryPolicy::from_config(&config.retry),
            last_retry_delays: Vec::new(),
        })
    }

    pub fn slot(&self) -> &WorkerSlot {
        &self.slot
    }

    pub fn backend_id(&self) -> &str {
        &self.connection.id
    }

    /// Sessions built so far, including the initial one
    pub fn sessions_built(&self) -> u32 {
        self.sessions_built
    }

    /// Backoff delays slept during the most recent fetch, in order
    pub fn last_retry_delays(&self) -> &[Duration] {
        &self.last_retry_delays
    }

    /// Executes one upstream operation
    pub async fn fetch(&mut self, operation: &FetchOperation) -> FetchOutcome {
        let outcome = self.fetch_path(&operation.path(), &operation.params()).await;
        debug!(
            "[slot {}] {} -> {}",
            self.slot.slot_id,
            operation,
            outcome_label(&outcome)
        );
        outcome
    }

    /// Fetches `path` with retries and classifies the final response
    pub async fn fetch_path(&mut self, path: &str, params: &[(&str, String)]) -> FetchOutcome {
        self.last_retry_delays.clear();
        let url = format!("{}{}", self.base_url, path);
        let mut transport_attempt = 0;
        let mut rate_limit_attempt = 0;

        loop {
            let verdict = match self.attempt(&url, params).await {
                Ok(verdict) => verdict,
                Err(e) => return FetchOutcome::TransportError(e.to_string()),
            };

            match verdict {
                Verdict::Done(outcome) => return outcome,
                Verdict::RetryTransport(message) => {
                    if transport_attempt >= self.retry.transport_retries {
                        return FetchOutcome::TransportError(message);
                    }
                    transport_attempt += 1;
                    let delay = self.retry.transport_delay(transport_attempt);
                    debug!(
                        "[slot {}] {} failed ({}), retry {} in {:?}",
                        self.slot.slot_id, path, message, transport_attempt, delay
                    );
                    self.backoff(delay).await;
                }
                Verdict::RetryRateLimit => {
                    if rate_limit_attempt >= self.retry.rate_limit_retries {
                        warn!(
                            "[slot {}] {} still rate limited after {} retries",
                            self.slot.slot_id, path, rate_limit_attempt
                        );
                        return FetchOutcome::RateLimited;
                    }
                    rate_limit_attempt += 1;
                    let delay = self.retry.rate_limit_delay(rate_limit_attempt);
                    debug!(
                        "[slot {}] {} rate limited, retry {} in {:?}",
                        self.slot.slot_id, path, rate_limit_attempt, delay
                    );
                    self.backoff(delay).await;
                }
            }
        }
    }

    /// Sends one request and reports its outcome to the registry
    async fn attempt(
        &mut self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<Verdict, HarvestError> {
        let permit = self.limiter.acquire(OpClass::Read).await?;
        self.recycle_if_exhausted();

        let user_agent = self.identities.next_agent().to_string();
        let started = Instant::now();
        let sent = self
            .session
            .get(url)
            .query(params)
            .header(USER_AGENT, user_agent)
            .header(ACCEPT, "application/json")
            .send()
            .await;
        self.session_requests += 1;

        let response = match sent {
            Ok(response) => {
                let status = response.status();
                response
                    .text()
                    .await
                    .map(|body| (status, body))
                    .map_err(|e| e.to_string())
            }
            Err(e) => {
                if e.is_connect() {
                    self.force_recycle = true;
                }
                Err(e.to_string())
            }
        };
        let latency = started.elapsed();
        permit.release();

        let (status, body) = match response {
            Ok(pair) => pair,
            Err(message) => {
                self.report(false, latency, Some(&message));
                return Ok(Verdict::RetryTransport(message));
            }
        };

        let verdict = match status {
            s if s.is_success() => match serde_json::from_str::<Value>(&body) {
                Ok(payload) => {
                    self.report(true, latency, None);
                    Verdict::Done(FetchOutcome::Ok(payload))
                }
                Err(e) => {
                    let message = format!("invalid JSON payload: {}", e);
                    self.report(false, latency, Some(&message));
                    Verdict::RetryTransport(message)
                }
            },
            StatusCode::NOT_FOUND => {
                self.report(true, latency, None);
                Verdict::Done(FetchOutcome::NotFound {
                    banned: is_banned(&body),
                })
            }
            StatusCode::FORBIDDEN => {
                // A bare 403 usually means the upstream blocked the proxy address
                let reason = forbidden_reason(&body);
                if reason.is_some() {
                    self.report(true, latency, None);
                } else {
                    self.report(false, latency, Some("HTTP 403"));
                }
                Verdict::Done(FetchOutcome::Forbidden { reason })
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.report(false, latency, Some("HTTP 429"));
                Verdict::RetryRateLimit
            }
            s if s.is_server_error() => {
                let message = format!("HTTP {}", s.as_u16());
                self.report(false, latency, Some(&message));
                Verdict::RetryTransport(message)
            }
            s => {
                let message = format!("unexpected HTTP {}", s.as_u16());
                self.report(false, latency, Some(&message));
                Verdict::Done(FetchOutcome::TransportError(message))
            }
        };

        Ok(verdict)
    }

    fn report(&self, success: bool, latency: Duration, error: Option<&str>) {
        if self
            .registry
            .report_outcome(&self.connection.id, success, latency, error)
        {
            warn!(
                "[slot {}] backend '{}' is now inactive",
                self.slot.slot_id, self.connection.id
            );
        }
    }

    async fn backoff(&mut self, delay: Duration) {
        self.last_retry_delays.push(delay);
        tokio::time::sleep(delay).await;
    }

    /// Rebuilds the session through the same backend once it is used up
    fn recycle_if_exhausted(&mut self) {
        if self.session_requests < self.session_max_requests && !self.force_recycle {
            return;
        }

        match (self.factory)(&self.connection) {
            Ok(session) => {
                self.session = session;
                self.session_requests = 0;
                self.force_recycle = false;
                self.sessions_built += 1;
                debug!(
                    "[slot {}] recycled session on backend '{}'",
                    self.slot.slot_id, self.connection.id
                );
            }
            Err(e) => {
                warn!(
                    "[slot {}] failed to rebuild session, keeping the current one: {}",
                    self.slot.slot_id, e
                );
            }
        }
    }
}

fn outcome_label(outcome: &FetchOutcome) -> &'static str {
    match outcome {
        FetchOutcome::Ok(_) => "ok",
        FetchOutcome::NotFound { banned: true } => "banned",
        FetchOutcome::NotFound { banned: false } => "not found",
        FetchOutcome::Forbidden { .. } => "forbidden",
        FetchOutcome::RateLimited => "rate limited",
        FetchOutcome::TransportError(_) => "transport error",
    }
}

/// Looks for a "banned" marker in a 404 body
fn is_banned(body: &str) -> bool {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => value
            .get("reason")
            .and_then(Value::as_str)
            .map(|r| r.eq_ignore_ascii_case("banned"))
            .unwrap_or(false),
        Err(_) => body.to_ascii_lowercase().contains("banned"),
    }
}

/// Extracts the `reason` field (private, quarantined, ...) from a 403 body
fn forbidden_reason(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("reason")?
        .as_str()
        .map(str::to_string)
}
