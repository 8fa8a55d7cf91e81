use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Providers ---

/// The upstream platforms posts are aggregated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Graph-style page feed.
    Facebook,
    /// Token-based user media.
    Instagram,
    /// Tweet timeline (API v2 or legacy v1.1).
    Twitter,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Facebook, Provider::Instagram, Provider::Twitter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Facebook => "facebook",
            Provider::Instagram => "instagram",
            Provider::Twitter => "twitter",
        }
    }

    /// Inclusive bounds on how many posts one query may ask for.
    pub fn count_bounds(&self) -> (u32, u32) {
        match self {
            Provider::Facebook => (1, 100),
            Provider::Instagram => (1, 100),
            Provider::Twitter => (1, 200),
        }
    }

    /// Cache lifetime used when the caller does not pick one.
    pub fn default_cache_ttl(&self) -> Duration {
        match self {
            Provider::Twitter => Duration::from_secs(15 * 60),
            _ => Duration::from_secs(60 * 60),
        }
    }

    pub fn default_count(&self) -> u32 {
        match self {
            Provider::Twitter => 5,
            _ => 10,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "facebook" | "fb" => Ok(Provider::Facebook),
            "instagram" | "ig" => Ok(Provider::Instagram),
            "twitter" | "x" => Ok(Provider::Twitter),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

// --- Normalized posts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Carousel,
    None,
}

impl MediaType {
    pub fn has_media(&self) -> bool {
        !matches!(self, MediaType::None)
    }
}

/// A provider-agnostic post. `raw` keeps the upstream item untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub provider: Provider,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub author_name: Option<String>,
    pub author_handle: Option<String>,
    pub media_url: Option<String>,
    pub media_type: MediaType,
    pub permalink: Option<String>,
    pub raw: serde_json::Value,
}

/// Drop later posts whose id was already seen, keeping upstream order.
pub fn dedup_by_id(posts: Vec<Post>) -> Vec<Post> {
    let mut seen = std::collections::HashSet::new();
    posts
        .into_iter()
        .filter(|p| seen.insert(p.id.clone()))
        .collect()
}

// --- Queries ---

/// Graph post-type filter. `All` is the caller's explicit "show every type" choice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PostTypeFilter {
    #[default]
    All,
    Only(String),
}

impl PostTypeFilter {
    pub fn matches(&self, status_type: Option<&str>) -> bool {
        match self {
            PostTypeFilter::All => true,
            PostTypeFilter::Only(wanted) => status_type == Some(wanted.as_str()),
        }
    }
}

impl fmt::Display for PostTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostTypeFilter::All => f.write_str("*"),
            PostTypeFilter::Only(t) => f.write_str(t),
        }
    }
}

/// What a caller wants from one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuery {
    pub provider: Provider,
    pub post_type_filter: PostTypeFilter,
    pub count: u32,
    pub cache_ttl: Duration,
    /// Media provider: show video thumbnails instead of the video asset.
    pub prefer_video_thumbnail: bool,
    /// Media provider: keep the post permalink.
    pub include_permalink: bool,
}

impl FetchQuery {
    pub fn new(provider: Provider, count: u32) -> Self {
        Self {
            provider,
            post_type_filter: PostTypeFilter::All,
            count,
            cache_ttl: provider.default_cache_ttl(),
            prefer_video_thumbnail: false,
            include_permalink: true,
        }
    }

    pub fn post_type(mut self, filter: PostTypeFilter) -> Self {
        self.post_type_filter = filter;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn prefer_video_thumbnail(mut self, yes: bool) -> Self {
        self.prefer_video_thumbnail = yes;
        self
    }

    pub fn include_permalink(mut self, yes: bool) -> Self {
        self.include_permalink = yes;
        self
    }

    /// `count` clamped into the provider's allowed range.
    pub fn bounded_count(&self) -> u32 {
        let (min, max) = self.provider.count_bounds();
        self.count.clamp(min, max)
    }

    /// Canonical form of everything that changes the upstream result (TTL excluded).
    pub fn normalized(&self) -> String {
        format!(
            "{}|type={}|count={}|thumb={}|link={}",
            self.provider,
            self.post_type_filter,
            self.bounded_count(),
            self.prefer_video_thumbnail,
            self.include_permalink,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str) -> Post {
        Post {
            id: id.to_string(),
            provider: Provider::Facebook,
            text: String::new(),
            created_at: None,
            author_name: None,
            author_handle: None,
            media_url: None,
            media_type: MediaType::None,
            permalink: None,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn provider_parses_aliases() {
        assert_eq!("FB".parse::<Provider>(), Ok(Provider::Facebook));
        assert_eq!("x".parse::<Provider>(), Ok(Provider::Twitter));
        assert!("myspace".parse::<Provider>().is_err());
    }

    #[test]
    fn count_is_clamped_per_provider() {
        assert_eq!(FetchQuery::new(Provider::Facebook, 0).bounded_count(), 1);
        assert_eq!(FetchQuery::new(Provider::Facebook, 500).bounded_count(), 100);
        assert_eq!(FetchQuery::new(Provider::Twitter, 150).bounded_count(), 150);
    }

    #[test]
    fn normalized_query_ignores_ttl() {
        let a = FetchQuery::new(Provider::Instagram, 6);
        let b = a.clone().cache_ttl(Duration::from_secs(5));
        assert_eq!(a.normalized(), b.normalized());

        let c = a.clone().prefer_video_thumbnail(true);
        assert_ne!(a.normalized(), c.normalized());
    }

    #[test]
    fn filter_all_matches_missing_status_type() {
        assert!(PostTypeFilter::All.matches(None));
        let photo = PostTypeFilter::Only("added_photos".into());
        assert!(photo.matches(Some("added_photos")));
        assert!(!photo.matches(Some("shared_story")));
        assert!(!photo.matches(None));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let posts = vec![post("a"), post("b"), post("a"), post("c")];
        let ids: Vec<_> = dedup_by_id(posts).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
