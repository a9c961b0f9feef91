//! Resilience primitives: persistence circuit breaker and retry schedules

mod backoff;
mod circuit_breaker;

pub use backoff::{rate_limit_delay, transport_delay, RetryPolicy};
pub use circuit_breaker::{BreakerState, CircuitBreaker};
