//! Buffered persistence
//!
//! Records are grouped per collection and written in chunks through the
//! persistence circuit breaker.

mod batch;

pub use batch::{BatchWriter, CollectionSpec, FailedRecord, FlushReport, ParentRule};
