//! Upstream payload shapes and their normalization into [`Post`].
//!
//! Each provider item is kept as a `serde_json::Value` so the normalized post
//! can carry it untouched in `raw`. Typed views are deserialized from a clone
//! of that value; an item that does not fit its view is skipped.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use socialfeed_common::{FetchQuery, MediaType, Post, Provider};
use tracing::warn;

/// One upstream response body, tagged by shape.
#[derive(Debug, Clone)]
pub enum RawResponse {
    /// One page of a Graph feed (`data` items).
    GraphStyle(Vec<Value>),
    /// User media listing.
    TokenMedia(Vec<Value>),
    /// Legacy v1.1 timeline array.
    TimelineV1(Vec<Value>),
    /// v2 timeline with its side tables, keyed by user id / media key.
    TimelineV2 {
        data: Vec<Value>,
        users: HashMap<String, Value>,
        media: HashMap<String, Value>,
    },
}

impl RawResponse {
    pub fn provider(&self) -> Provider {
        match self {
            RawResponse::GraphStyle(_) => Provider::Facebook,
            RawResponse::TokenMedia(_) => Provider::Instagram,
            RawResponse::TimelineV1(_) | RawResponse::TimelineV2 { .. } => Provider::Twitter,
        }
    }

    /// Normalize every item, skipping the ones that cannot be read.
    pub fn into_posts(self, query: &FetchQuery) -> Vec<Post> {
        let provider = self.provider();
        let mapped: Vec<Option<Post>> = match self {
            RawResponse::GraphStyle(items) => items.into_iter().map(map_graph_item).collect(),
            RawResponse::TokenMedia(items) => items
                .into_iter()
                .map(|item| map_media_item(item, query))
                .collect(),
            RawResponse::TimelineV1(items) => items.into_iter().map(map_v1_tweet).collect(),
            RawResponse::TimelineV2 { data, users, media } => data
                .into_iter()
                .map(|item| map_v2_tweet(item, &users, &media))
                .collect(),
        };

        let total = mapped.len();
        let posts: Vec<Post> = mapped.into_iter().flatten().collect();
        if posts.len() < total {
            warn!(
                provider = %provider,
                skipped = total - posts.len(),
                "Skipped malformed items"
            );
        }
        posts
    }
}

fn view<T: for<'de> Deserialize<'de>>(item: &Value) -> Option<T> {
    serde_json::from_value(item.clone()).ok()
}

/// Graph/media timestamps look like `2023-01-05T12:00:00+0000`; v2 uses RFC 3339;
/// v1.1 uses `Wed Oct 10 20:19:24 +0000 2018`.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .or_else(|_| DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// --- Graph ---

#[derive(Deserialize)]
struct GraphItem {
    id: String,
    message: Option<String>,
    created_time: Option<String>,
    permalink_url: Option<String>,
    picture: Option<String>,
    status_type: Option<String>,
    from: Option<GraphAuthor>,
}

#[derive(Deserialize)]
struct GraphAuthor {
    name: Option<String>,
    id: Option<String>,
}

/// `status_type` of a Graph item, if any.
pub(crate) fn graph_status_type(item: &Value) -> Option<&str> {
    item.get("status_type").and_then(Value::as_str)
}

fn graph_media_type(status_type: Option<&str>, has_picture: bool) -> MediaType {
    let status = status_type.unwrap_or_default();
    if status.contains("video") {
        MediaType::Video
    } else if has_picture || status.contains("photo") {
        MediaType::Image
    } else {
        MediaType::None
    }
}

fn map_graph_item(item: Value) -> Option<Post> {
    let g: GraphItem = view(&item)?;
    let media_type = graph_media_type(g.status_type.as_deref(), g.picture.is_some());
    let (author_name, author_handle) = match g.from {
        Some(from) => (from.name, from.id),
        None => (None, None),
    };

    Some(Post {
        id: g.id,
        provider: Provider::Facebook,
        text: g.message.unwrap_or_default(),
        created_at: g.created_time.as_deref().and_then(parse_timestamp),
        author_name,
        author_handle,
        media_url: g.picture,
        media_type,
        permalink: g.permalink_url,
        raw: item,
    })
}

// --- Media ---

#[derive(Deserialize)]
struct MediaItem {
    id: String,
    caption: Option<String>,
    media_type: Option<String>,
    media_url: Option<String>,
    permalink: Option<String>,
    thumbnail_url: Option<String>,
    timestamp: Option<String>,
    username: Option<String>,
}

fn map_media_item(item: Value, query: &FetchQuery) -> Option<Post> {
    let m: MediaItem = view(&item)?;

    let mut media_type = match m.media_type.as_deref() {
        Some("VIDEO") => MediaType::Video,
        Some("CAROUSEL_ALBUM") => MediaType::Carousel,
        _ => MediaType::Image,
    };
    let mut media_url = m.media_url;
    if query.prefer_video_thumbnail && media_type == MediaType::Video {
        media_type = MediaType::Image;
        media_url = m.thumbnail_url;
    }

    Some(Post {
        id: m.id,
        provider: Provider::Instagram,
        text: m.caption.unwrap_or_default(),
        created_at: m.timestamp.as_deref().and_then(parse_timestamp),
        author_name: m.username.clone(),
        author_handle: m.username,
        media_url,
        media_type,
        permalink: m.permalink.filter(|_| query.include_permalink),
        raw: item,
    })
}

// --- Timeline ---

fn tweet_permalink(handle: Option<&str>, id: &str) -> String {
    match handle {
        Some(handle) => format!("https://twitter.com/{handle}/status/{id}"),
        None => format!("https://twitter.com/i/web/status/{id}"),
    }
}

fn tweet_media_type(kind: &str) -> MediaType {
    match kind {
        "photo" => MediaType::Image,
        "video" | "animated_gif" => MediaType::Video,
        _ => MediaType::None,
    }
}

#[derive(Deserialize)]
struct V1Tweet {
    id_str: String,
    full_text: Option<String>,
    text: Option<String>,
    created_at: Option<String>,
    user: Option<V1User>,
    extended_entities: Option<V1Entities>,
    entities: Option<V1Entities>,
}

#[derive(Deserialize)]
struct V1User {
    name: Option<String>,
    screen_name: Option<String>,
}

#[derive(Deserialize)]
struct V1Entities {
    #[serde(default)]
    media: Vec<V1Media>,
}

#[derive(Deserialize)]
struct V1Media {
    #[serde(rename = "type")]
    kind: Option<String>,
    media_url_https: Option<String>,
}

fn map_v1_tweet(item: Value) -> Option<Post> {
    let t: V1Tweet = view(&item)?;
    let (author_name, author_handle) = match t.user {
        Some(user) => (user.name, user.screen_name),
        None => (None, None),
    };
    let first_media = t
        .extended_entities
        .or(t.entities)
        .and_then(|e| e.media.into_iter().next());
    let (media_url, media_type) = match first_media {
        Some(m) => (
            m.media_url_https,
            tweet_media_type(m.kind.as_deref().unwrap_or("photo")),
        ),
        None => (None, MediaType::None),
    };

    Some(Post {
        permalink: Some(tweet_permalink(author_handle.as_deref(), &t.id_str)),
        id: t.id_str,
        provider: Provider::Twitter,
        text: t.full_text.or(t.text).unwrap_or_default(),
        created_at: t.created_at.as_deref().and_then(parse_timestamp),
        author_name,
        author_handle,
        media_url,
        media_type,
        raw: item,
    })
}

#[derive(Deserialize)]
struct V2Tweet {
    id: String,
    text: Option<String>,
    created_at: Option<String>,
    author_id: Option<String>,
    attachments: Option<V2Attachments>,
}

#[derive(Deserialize)]
struct V2Attachments {
    #[serde(default)]
    media_keys: Vec<String>,
}

#[derive(Deserialize)]
struct V2User {
    name: Option<String>,
    username: Option<String>,
}

#[derive(Deserialize)]
struct V2Media {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
    preview_image_url: Option<String>,
}

/// The tweet with its author and media joined in from the side tables.
fn map_v2_tweet(
    mut item: Value,
    users: &HashMap<String, Value>,
    media: &HashMap<String, Value>,
) -> Option<Post> {
    let t: V2Tweet = view(&item)?;

    let author = t.author_id.as_deref().and_then(|id| users.get(id)).cloned();
    let attached: Vec<Value> = t
        .attachments
        .map(|a| a.media_keys)
        .unwrap_or_default()
        .iter()
        .filter_map(|key| media.get(key).cloned())
        .collect();

    let user: Option<V2User> = author.as_ref().and_then(view);
    let first_media: Option<V2Media> = attached.first().and_then(view);

    if let Some(object) = item.as_object_mut() {
        if let Some(author) = author {
            object.insert("author".to_string(), author);
        }
        if !attached.is_empty() {
            object.insert("media".to_string(), Value::Array(attached));
        }
    }

    let (author_name, author_handle) = match user {
        Some(user) => (user.name, user.username),
        None => (None, None),
    };
    let (media_url, media_type) = match first_media {
        Some(m) => {
            let kind = tweet_media_type(m.kind.as_deref().unwrap_or_default());
            (m.url.or(m.preview_image_url), kind)
        }
        None => (None, MediaType::None),
    };

    Some(Post {
        permalink: Some(tweet_permalink(author_handle.as_deref(), &t.id)),
        id: t.id,
        provider: Provider::Twitter,
        text: t.text.unwrap_or_default(),
        created_at: t.created_at.as_deref().and_then(parse_timestamp),
        author_name,
        author_handle,
        media_url,
        media_type,
        raw: item,
    })
}
