//! Concrete harvesting of communities and users
//!
//! [`CommunityProcessor`] is the [`TargetProcessor`](crate::scheduler::TargetProcessor)
//! the engine plugs into the scheduler. The extraction helpers are pure
//! functions over API payloads.

mod extract;
mod processor;

pub use extract::{
    community_mentions, community_record, discover, listing_items, post_records, rule_records,
    thing_data, user_activity, user_record,
};
pub use processor::{
    register_collections, CommunityProcessor, COMMUNITIES, COMMUNITY_RULES, POSTS, USERS,
};
