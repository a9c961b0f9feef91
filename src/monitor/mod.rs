//! Resource monitoring

mod memory;

pub use memory::{MemoryLevel, MemoryMonitor, MemoryReport, MemorySampler, ProcessSampler};
