//! Upstream HTTP client
//!
//! This module handles all requests to the upstream API:
//! - One proxied session per worker slot, recycled after a request budget
//! - User-Agent rotation
//! - Retry with separate transport and 429 budgets
//! - Classification into [`FetchOutcome`]

mod identity;
mod operation;
mod session;
mod worker;

pub use identity::IdentityPool;
pub use operation::{FetchOperation, PostSort, TimeFilter};
pub use session::{build_session, proxied_factory, SessionFactory};
pub use worker::{FetchOutcome, WorkerClient};
