//! Egress proxy management
//!
//! Backends are loaded from configuration, probed at startup, assigned
//! to worker slots by quota and priority, and disabled when their error
//! streak crosses the configured threshold. Disabled backends are probed
//! again before each cycle and come back once they answer.

mod backend;
mod probe;
mod registry;

pub use backend::{ProxyBackend, ProxyConnection, ProxyStats};
pub use probe::probe_with;
pub use registry::{BackendSnapshot, ProxyRegistry, WorkerSlot};
