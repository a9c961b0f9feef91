//! Community and user harvesting
//!
//! # Responsibilities
//!
//! - Fetch community metadata (cached), recent posts and rules
//! - Fetch user profiles and their recent submissions
//! - Hand the extracted records to the [`BatchWriter`]
//! - Report wave-two candidates back to the scheduler

use crate::cache::TtlCache;
use crate::client::{FetchOperation, PostSort, TimeFilter, WorkerClient};
use crate::config::Config;
use crate::harvest::extract::{
    community_record, discover, post_records, rule_records, thing_data, user_activity,
    user_record,
};
use crate::scheduler::{ItemOutput, Target, TargetKind, TargetProcessor};
use crate::storage::Record;
use crate::writer::{BatchWriter, CollectionSpec, ParentRule};
use crate::HarvestError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const COMMUNITIES: &str = "communities";
pub const POSTS: &str = "posts";
pub const USERS: &str = "users";
pub const COMMUNITY_RULES: &str = "community_rules";

/// Registers the harvested collections and their parent references
pub fn register_collections(writer: BatchWriter) -> BatchWriter {
    writer
        .with_collection(CollectionSpec::new(COMMUNITIES, &["name"]))
        .with_collection(CollectionSpec::new(POSTS, &["id"]))
        .with_collection(CollectionSpec::new(USERS, &["username"]))
        .with_collection(CollectionSpec::new(
            COMMUNITY_RULES,
            &["community", "short_name"],
        ))
        .with_parent_rule(ParentRule::new(POSTS, "community", COMMUNITIES, "name"))
        .with_parent_rule(ParentRule::new(POSTS, "author", USERS, "username"))
        .with_parent_rule(ParentRule::new(
            COMMUNITY_RULES,
            "community",
            COMMUNITIES,
            "name",
        ))
}

/// [`TargetProcessor`] for communities and users
pub struct CommunityProcessor {
    writer: Arc<BatchWriter>,
    about_cache: Arc<TtlCache<String, Value>>,
    sort: PostSort,
    time_filter: Option<TimeFilter>,
    limit: u32,
    fetch_rules: bool,
}

impl CommunityProcessor {
    pub fn new(
        writer: Arc<BatchWriter>,
        about_cache: Arc<TtlCache<String, Value>>,
        config: &Config,
    ) -> Self {
        Self {
            writer,
            about_cache,
            sort: PostSort::New,
            time_filter: None,
            limit: config.upstream.listing_limit,
            fetch_rules: true,
        }
    }

    /// Changes which listing is harvested for communities
    ///
    /// The time filter only matters for `top` listings.
    pub fn with_listing(mut self, sort: PostSort, time_filter: Option<TimeFilter>) -> Self {
        self.sort = sort;
        self.time_filter = time_filter;
        self
    }

    /// Turns rule fetching on or off
    pub fn with_rules(mut self, enabled: bool) -> Self {
        self.fetch_rules = enabled;
        self
    }

    /// Buffers records; a full batch wakes the writer's flush task
    fn emit(&self, collection: &str, records: Vec<Record>) -> Result<usize, HarvestError> {
        let count = records.len();
        for record in records {
            if self.writer.enqueue(collection, record)? {
                debug!("'{}' reached its batch size, flush requested", collection);
            }
        }
        Ok(count)
    }

    /// Community metadata, served from the cache when fresh
    async fn community_about(
        &self,
        client: &mut WorkerClient,
        name: &str,
    ) -> Result<Value, HarvestError> {
        let key = name.to_ascii_lowercase();
        if let Some(about) = self.about_cache.get(&key) {
            return Ok(about);
        }

        let operation = FetchOperation::CommunityAbout {
            name: name.to_string(),
        };
        let payload = client.fetch(&operation).await.into_result(name)?;
        // unknown names come back as a search listing instead of a t5 thing
        let Some(data) = thing_data(&payload, "t5") else {
            return Err(HarvestError::NotFound {
                target: name.to_string(),
                banned: false,
            });
        };

        let data = data.clone();
        self.about_cache.set(key, data.clone());
        Ok(data)
    }

    async fn process_community(
        &self,
        client: &mut WorkerClient,
        name: &str,
    ) -> Result<ItemOutput, HarvestError> {
        let about = self.community_about(client, name).await?;
        let community = community_record(&about).ok_or_else(|| HarvestError::Payload {
            target: name.to_string(),
            message: "community without display_name".to_string(),
        })?;
        // canonical casing from the upstream
        let canonical = community
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();

        let mut records = self.emit(COMMUNITIES, vec![community])?;

        let posts = FetchOperation::CommunityPosts {
            name: canonical.clone(),
            sort: self.sort,
            time_filter: self.time_filter,
            limit: self.limit,
        };
        let listing = client.fetch(&posts).await.into_result(name)?;
        let post_rows = post_records(&listing, &canonical);
        let skipped = post_rows.is_empty();
        records += self.emit(POSTS, post_rows)?;

        if self.fetch_rules {
            let rules = FetchOperation::CommunityRules {
                name: canonical.clone(),
            };
            match client.fetch(&rules).await.into_result(name) {
                Ok(payload) => {
                    records += self.emit(COMMUNITY_RULES, rule_records(&payload, &canonical))?;
                }
                Err(e) => warn!("Rules for {} unavailable: {}", canonical, e),
            }
        }

        Ok(ItemOutput {
            records,
            discovered: discover(&listing, &canonical),
            skipped,
        })
    }

    async fn process_user(
        &self,
        client: &mut WorkerClient,
        username: &str,
    ) -> Result<ItemOutput, HarvestError> {
        let profile = FetchOperation::UserProfile {
            username: username.to_string(),
        };
        let payload = client.fetch(&profile).await.into_result(username)?;
        let data = thing_data(&payload, "t2").ok_or_else(|| HarvestError::Payload {
            target: username.to_string(),
            message: "expected a t2 user payload".to_string(),
        })?;
        let user = user_record(data).ok_or_else(|| HarvestError::Payload {
            target: username.to_string(),
            message: "user without name".to_string(),
        })?;

        let suspended = data
            .get("is_suspended")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut records = self.emit(USERS, vec![user])?;
        if suspended {
            return Ok(ItemOutput {
                records,
                discovered: Vec::new(),
                skipped: true,
            });
        }

        let submissions = FetchOperation::UserSubmissions {
            username: username.to_string(),
            limit: self.limit,
        };
        let listing = client.fetch(&submissions).await.into_result(username)?;
        records += self.emit(POSTS, post_records(&listing, ""))?;

        let mut discovered = user_activity(&listing, username);
        discovered.extend(
            discover(&listing, username)
                .into_iter()
                .filter(|d| d.kind == TargetKind::Community),
        );

        Ok(ItemOutput {
            records,
            discovered,
            skipped: false,
        })
    }
}

#[async_trait]
impl TargetProcessor for CommunityProcessor {
    async fn process(
        &self,
        client: &mut WorkerClient,
        target: &Target,
    ) -> Result<ItemOutput, HarvestError> {
        match target.kind {
            TargetKind::Community => self.process_community(client, &target.name).await,
            TargetKind::User => self.process_user(client, &target.name).await,
        }
    }
}
