//! Record and discovery extraction from API payloads
//!
//! This module turns the JSON returned by the upstream into:
//! - Store records (`communities`, `posts`, `users`, `community_rules`)
//! - Wave-two discovery candidates (crosspost origins, `r/name` mentions,
//!   post authors, communities a user is active in)
//!
//! Null fields are left out of records so that protected columns already in
//! the store are never overwritten with nothing.

use crate::scheduler::{DiscoveryReason, DiscoveryResult, TargetKind};
use crate::storage::Record;
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Community fields copied verbatim from `about.json`
const COMMUNITY_FIELDS: &[&str] = &[
    "title",
    "public_description",
    "subscribers",
    "active_user_count",
    "over18",
    "subreddit_type",
    "lang",
    "created_utc",
    "url",
];

const POST_FIELDS: &[&str] = &[
    "title",
    "score",
    "upvote_ratio",
    "num_comments",
    "created_utc",
    "permalink",
    "url",
    "over_18",
    "is_self",
    "link_flair_text",
];

const USER_FIELDS: &[&str] = &[
    "link_karma",
    "comment_karma",
    "created_utc",
    "is_suspended",
    "verified",
];

const RULE_FIELDS: &[&str] = &["description", "kind", "priority", "violation_reason"];

/// Shortest and longest valid community names
const NAME_LEN: std::ops::RangeInclusive<usize> = 3..=21;

/// Returns the `data` object of a thing (`{"kind": ..., "data": {...}}`)
///
/// The caller names the `kind` it expects ("t5" community, "t2" user).
pub fn thing_data<'a>(payload: &'a Value, kind: &str) -> Option<&'a Value> {
    if payload.get("kind").and_then(Value::as_str) != Some(kind) {
        return None;
    }
    payload.get("data").filter(|d| d.is_object())
}

/// Iterates the `data` objects of a listing's children
pub fn listing_items(listing: &Value) -> impl Iterator<Item = &Value> {
    listing
        .pointer("/data/children")
        .and_then(Value::as_array)
        .map(|children| children.as_slice())
        .unwrap_or(&[])
        .iter()
        .filter_map(|child| child.get("data"))
}

fn copy_fields(data: &Value, fields: &[&str], out: &mut Record) {
    for field in fields {
        if let Some(value) = data.get(*field) {
            if !value.is_null() {
                out.insert((*field).to_string(), value.clone());
            }
        }
    }
}

fn stamp(out: &mut Record) {
    out.insert(
        "harvested_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
}

fn str_field<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Builds a `communities` record from the `data` of an about payload
pub fn community_record(data: &Value) -> Option<Record> {
    let name = str_field(data, "display_name")?;
    let mut record = Record::new();
    record.insert("name".to_string(), Value::String(name.to_string()));
    copy_fields(data, COMMUNITY_FIELDS, &mut record);
    if !record.contains_key("active_user_count") {
        if let Some(active) = data.get("accounts_active").filter(|v| !v.is_null()) {
            record.insert("active_user_count".to_string(), active.clone());
        }
    }
    stamp(&mut record);
    Some(record)
}

/// Builds a `users` record from the `data` of a user about payload
pub fn user_record(data: &Value) -> Option<Record> {
    let name = str_field(data, "name")?;
    let mut record = Record::new();
    record.insert("username".to_string(), Value::String(name.to_string()));
    copy_fields(data, USER_FIELDS, &mut record);
    stamp(&mut record);
    Some(record)
}

/// Builds `posts` records from a listing
///
/// `community` is used when a post does not name its own community; pass an
/// empty string to leave the field out. Deleted authors are left out so no
/// placeholder user is created for them.
pub fn post_records(listing: &Value, community: &str) -> Vec<Record> {
    listing_items(listing)
        .filter_map(|post| {
            let id = str_field(post, "id")?;
            let mut record = Record::new();
            record.insert("id".to_string(), Value::String(id.to_string()));
            let home = str_field(post, "subreddit").unwrap_or(community);
            if !home.is_empty() {
                record.insert("community".to_string(), Value::String(home.to_string()));
            }
            if let Some(author) = str_field(post, "author").filter(|a| is_real_author(a)) {
                record.insert("author".to_string(), Value::String(author.to_string()));
            }
            copy_fields(post, POST_FIELDS, &mut record);
            if let Some(origin) = crosspost_origin(post) {
                record.insert(
                    "crosspost_from".to_string(),
                    Value::String(origin.to_string()),
                );
            }
            stamp(&mut record);
            Some(record)
        })
        .collect()
}

/// Builds `community_rules` records from a rules payload
pub fn rule_records(rules: &Value, community: &str) -> Vec<Record> {
    rules
        .get("rules")
        .and_then(Value::as_array)
        .map(|rules| rules.as_slice())
        .unwrap_or(&[])
        .iter()
        .filter_map(|rule| {
            let short_name = str_field(rule, "short_name")?;
            let mut record = Record::new();
            record.insert(
                "community".to_string(),
                Value::String(community.to_string()),
            );
            record.insert(
                "short_name".to_string(),
                Value::String(short_name.to_string()),
            );
            copy_fields(rule, RULE_FIELDS, &mut record);
            Some(record)
        })
        .collect()
}

fn is_real_author(name: &str) -> bool {
    !matches!(name, "[deleted]" | "[removed]" | "AutoModerator")
}

fn crosspost_origin(post: &Value) -> Option<&str> {
    post.get("crosspost_parent_list")?
        .as_array()?
        .first()
        .and_then(|parent| str_field(parent, "subreddit"))
}

/// `r/name` at the start of the text or after whitespace, an opening
/// bracket, a slash, a quote, a comma or `>`
static MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s(\[/"',>])r/([A-Za-z0-9_]+)"#).expect("valid mention pattern")
});

/// Finds `r/name` mentions in free text
///
/// The name run is matched greedily, so names outside 3 to 21 word
/// characters are dropped rather than truncated.
pub fn community_mentions(text: &str) -> Vec<String> {
    MENTION
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|name| name.as_str())
        .filter(|name| NAME_LEN.contains(&name.len()))
        .map(str::to_string)
        .collect()
}

/// Collects wave-two candidates from a listing harvested for `source`
///
/// Each candidate carries the score of the post that referenced it. A post's
/// own community is never reported as a mention or crosspost origin.
pub fn discover(listing: &Value, source: &str) -> Vec<DiscoveryResult> {
    let mut found = Vec::new();

    for post in listing_items(listing) {
        let weight = post.get("score").and_then(Value::as_i64).unwrap_or(0);
        let home = str_field(post, "subreddit").unwrap_or(source);
        let mut push = |name: &str, kind: TargetKind, reason: DiscoveryReason| {
            found.push(DiscoveryResult {
                name: name.to_string(),
                kind,
                reason,
                source: source.to_string(),
                weight,
            });
        };

        if let Some(origin) = crosspost_origin(post) {
            if !origin.eq_ignore_ascii_case(home) {
                push(origin, TargetKind::Community, DiscoveryReason::Crosspost);
            }
        }

        let mut mentioned = HashSet::new();
        for field in ["title", "selftext"] {
            let Some(text) = post.get(field).and_then(Value::as_str) else {
                continue;
            };
            for name in community_mentions(text) {
                if !name.eq_ignore_ascii_case(home) && mentioned.insert(name.to_ascii_lowercase()) {
                    push(&name, TargetKind::Community, DiscoveryReason::Mention);
                }
            }
        }

        if let Some(author) = str_field(post, "author").filter(|a| is_real_author(a)) {
            push(author, TargetKind::User, DiscoveryReason::Author);
        }
    }

    found
}

/// Communities a user posted in, from their submissions listing
pub fn user_activity(listing: &Value, username: &str) -> Vec<DiscoveryResult> {
    let mut seen = HashSet::new();
    listing_items(listing)
        .filter_map(|post| {
            let community = str_field(post, "subreddit")?;
            // user profiles show up as "u_name" pseudo-communities
            if community.starts_with("u_") || !seen.insert(community.to_ascii_lowercase()) {
                return None;
            }
            Some(DiscoveryResult {
                name: community.to_string(),
                kind: TargetKind::Community,
                reason: DiscoveryReason::Activity,
                source: username.to_string(),
                weight: post.get("score").and_then(Value::as_i64).unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing() -> Value {
        json!({
            "kind": "Listing",
            "data": {
                "children": [
                    {"kind": "t3", "data": {
                        "id": "abc1",
                        "subreddit": "rust",
                        "author": "ferris",
                        "title": "Cross-posting from r/programming and r/rust",
                        "selftext": "see also /r/learnrust, r/ab and r/programming",
                        "score": 120,
                        "link_flair_text": null,
                        "crosspost_parent_list": [{"subreddit": "golang"}]
                    }},
                    {"kind": "t3", "data": {
                        "id": "abc2",
                        "subreddit": "rust",
                        "author": "[deleted]",
                        "title": "plain title",
                        "score": 3
                    }}
                ]
            }
        })
    }

    #[test]
    fn test_community_mentions() {
        assert_eq!(
            community_mentions("r/rust at start, (r/golang) and https://x.com/r/learnrust"),
            vec!["rust", "golang", "learnrust"]
        );
        assert!(community_mentions("our/rust bar/baz").is_empty());
        assert!(community_mentions("r/ab too short").is_empty());
        assert!(community_mentions("dangling r/").is_empty());
        assert_eq!(community_mentions("ünïcode r/rust_lang!"), vec!["rust_lang"]);
    }

    #[test]
    fn test_community_mentions_adjacent_and_overlong() {
        assert_eq!(
            community_mentions("see r/rust,r/golang/r/zig and \"r/ocaml\" or <b>r/nim</b>"),
            vec!["rust", "golang", "zig", "ocaml", "nim"]
        );
        assert_eq!(
            community_mentions("r/abcdefghijklmnopqrstuvwxyz r/abcdefghijklmnopqrstu"),
            vec!["abcdefghijklmnopqrstu"]
        );
        assert!(community_mentions("r/rüst is not ascii").is_empty());
    }

    #[test]
    fn test_community_record_omits_nulls() {
        let data = json!({
            "display_name": "rust",
            "title": "The Rust Programming Language",
            "subscribers": 300000,
            "accounts_active": 1200,
            "public_description": null,
            "category": "ignored"
        });
        let record = community_record(&data).unwrap();

        assert_eq!(record["name"], json!("rust"));
        assert_eq!(record["subscribers"], json!(300000));
        assert_eq!(record["active_user_count"], json!(1200));
        assert!(!record.contains_key("public_description"));
        assert!(!record.contains_key("category"));
        assert!(record.contains_key("harvested_at"));

        assert!(community_record(&json!({"title": "no name"})).is_none());
    }

    #[test]
    fn test_thing_data_checks_kind() {
        let about = json!({"kind": "t5", "data": {"display_name": "rust"}});
        assert!(thing_data(&about, "t5").is_some());
        assert!(thing_data(&about, "t2").is_none());
        assert!(thing_data(&json!({"kind": "Listing", "data": {}}), "t5").is_none());
    }

    #[test]
    fn test_post_records() {
        let records = post_records(&listing(), "fallback");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], json!("abc1"));
        assert_eq!(records[0]["community"], json!("rust"));
        assert_eq!(records[0]["author"], json!("ferris"));
        assert_eq!(records[0]["crosspost_from"], json!("golang"));
        assert!(!records[0].contains_key("link_flair_text"));
        assert!(!records[1].contains_key("author"));
    }

    #[test]
    fn test_rule_records() {
        let rules = json!({"rules": [
            {"short_name": "Be civil", "kind": "all", "priority": 0},
            {"description": "no short name"}
        ]});
        let records = rule_records(&rules, "rust");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["community"], json!("rust"));
        assert_eq!(records[0]["short_name"], json!("Be civil"));
    }

    #[test]
    fn test_discover_reasons_and_weights() {
        let found = discover(&listing(), "rust");

        let summary: Vec<(&str, DiscoveryReason, i64)> = found
            .iter()
            .map(|d| (d.name.as_str(), d.reason, d.weight))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("golang", DiscoveryReason::Crosspost, 120),
                ("programming", DiscoveryReason::Mention, 120),
                ("learnrust", DiscoveryReason::Mention, 120),
                ("ferris", DiscoveryReason::Author, 120),
            ]
        );
        assert_eq!(found[3].kind, TargetKind::User);
        assert!(found.iter().all(|d| d.source == "rust"));
    }

    #[test]
    fn test_user_activity_dedupes_and_skips_profiles() {
        let submissions = json!({"data": {"children": [
            {"data": {"subreddit": "rust", "score": 10}},
            {"data": {"subreddit": "Rust", "score": 50}},
            {"data": {"subreddit": "u_ferris", "score": 1}},
            {"data": {"subreddit": "golang", "score": 2}}
        ]}});
        let found = user_activity(&submissions, "ferris");

        let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["rust", "golang"]);
        assert_eq!(found[0].weight, 10);
        assert_eq!(found[0].reason, DiscoveryReason::Activity);
    }
}
