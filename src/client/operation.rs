//! Upstream fetch operations
//!
//! Each variant maps to one read-only JSON endpoint. Adding an endpoint means
//! adding a variant; there is no lookup by method name.

use std::fmt;

/// Listing order for community posts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSort {
    Hot,
    New,
    Top,
    Rising,
}

impl PostSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::New => "new",
            Self::Top => "top",
            Self::Rising => "rising",
        }
    }
}

/// Time window for `top` listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::All => "all",
        }
    }
}

/// A single read against the upstream API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOperation {
    CommunityAbout {
        name: String,
    },
    CommunityPosts {
        name: String,
        sort: PostSort,
        time_filter: Option<TimeFilter>,
        limit: u32,
    },
    CommunityRules {
        name: String,
    },
    UserProfile {
        username: String,
    },
    UserSubmissions {
        username: String,
        limit: u32,
    },
}

impl FetchOperation {
    /// Endpoint path relative to the upstream base URL
    pub fn path(&self) -> String {
        match self {
            Self::CommunityAbout { name } => format!("/r/{}/about.json", name),
            Self::CommunityPosts { name, sort, .. } => format!("/r/{}/{}.json", name, sort.as_str()),
            Self::CommunityRules { name } => format!("/r/{}/about/rules.json", name),
            Self::UserProfile { username } => format!("/user/{}/about.json", username),
            Self::UserSubmissions { username, .. } => format!("/user/{}/submitted.json", username),
        }
    }

    /// Query parameters for the request
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("raw_json", "1".to_string())];
        match self {
            Self::CommunityPosts {
                time_filter, limit, ..
            } => {
                if let Some(t) = time_filter {
                    params.push(("t", t.as_str().to_string()));
                }
                params.push(("limit", limit.to_string()));
            }
            Self::UserSubmissions { limit, .. } => {
                params.push(("limit", limit.to_string()));
            }
            _ => {}
        }
        params
    }

    /// Entity the operation is about, for logs and errors
    pub fn target(&self) -> &str {
        match self {
            Self::CommunityAbout { name }
            | Self::CommunityPosts { name, .. }
            | Self::CommunityRules { name } => name,
            Self::UserProfile { username } | Self::UserSubmissions { username, .. } => username,
        }
    }
}

impl fmt::Display for FetchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}
