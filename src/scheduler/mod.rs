//! Discovery scheduling
//!
//! Targets, item states, partitioning over worker slots, pacing, and the
//! two-wave cycle that ties them together.

mod discovery;
mod item;
mod partition;
mod stealth;

pub use discovery::{
    CycleStats, DiscoveryScheduler, ItemOutput, PromotionPredicate, TargetProcessor, WaveStats,
};
pub use item::{
    DiscoveryReason, DiscoveryResult, ItemState, Target, TargetKind, TrackedItem, Wave,
};
pub use partition::{interleave_by_group, partition};
pub use stealth::StealthPacer;
