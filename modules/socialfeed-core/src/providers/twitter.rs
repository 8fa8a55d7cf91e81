// Tweet timeline over API v2 (bearer token) or legacy v1.1 (OAuth 1.0a).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use socialfeed_common::{
    dedup_by_id, Credential, FeedError, FetchQuery, Post, Provider, Result, TimelineProtocol,
    TwitterCredential,
};
use socialfeed_http::{HttpRequest, HttpTransport};
use tracing::info;

use super::oauth1::{authorization_header, OAuth1Keys};
use super::{check_status, data_array, parse_body, Endpoints, ProviderClient};
use crate::clock::Clock;
use crate::raw::RawResponse;

/// `max_results` bounds of the v2 timeline endpoint.
const V2_MIN_RESULTS: u32 = 5;
const V2_MAX_RESULTS: u32 = 100;

pub struct TimelineClient {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    base: String,
    credential: TwitterCredential,
    protocol: TimelineProtocol,
}

impl TimelineClient {
    /// Fails with `ConfigIncomplete` when neither protocol is usable.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        endpoints: &Endpoints,
        credential: &TwitterCredential,
    ) -> Result<Self> {
        let protocol = credential.protocol().ok_or_else(|| FeedError::ConfigIncomplete {
            provider: Provider::Twitter,
            missing: Credential::Twitter(credential.clone()).missing_fields(),
        })?;

        Ok(Self {
            transport,
            clock,
            base: endpoints.timeline.clone(),
            credential: credential.clone(),
            protocol,
        })
    }

    pub fn protocol(&self) -> TimelineProtocol {
        self.protocol
    }

    async fn fetch_v2(&self, count: u32) -> Result<RawResponse> {
        let url = format!("{}/2/users/{}/tweets", self.base, self.credential.user_id);
        let max_results = count.clamp(V2_MIN_RESULTS, V2_MAX_RESULTS);

        let request = HttpRequest::get(url)
            .header("Authorization", format!("Bearer {}", self.credential.bearer_token))
            .query("max_results", max_results.to_string())
            .query("tweet.fields", "created_at,author_id,attachments")
            .query("expansions", "author_id,attachments.media_keys")
            .query("user.fields", "name,username")
            .query("media.fields", "type,url,preview_image_url");
        let response = self.transport.send(request).await?;
        check_status(Provider::Twitter, &response, self.clock.now())?;

        let mut body = parse_body(Provider::Twitter, &response)?;
        let data = data_array(Provider::Twitter, &mut body)?;
        let users = side_table(&body, "/includes/users", "id");
        let media = side_table(&body, "/includes/media", "media_key");

        Ok(RawResponse::TimelineV2 { data, users, media })
    }

    async fn fetch_v1(&self, count: u32) -> Result<RawResponse> {
        let url = format!("{}/1.1/statuses/user_timeline.json", self.base);
        let query = vec![
            ("count".to_string(), count.to_string()),
            ("tweet_mode".to_string(), "extended".to_string()),
        ];

        let keys = OAuth1Keys {
            consumer_key: &self.credential.consumer_key,
            consumer_secret: &self.credential.consumer_secret,
            token: &self.credential.access_token,
            token_secret: &self.credential.access_token_secret,
        };
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let header = authorization_header(
            &keys,
            "GET",
            &url,
            &query,
            &nonce,
            self.clock.now().timestamp(),
        )?;

        let mut request = HttpRequest::get(url).header("Authorization", header);
        request.query = query;
        let response = self.transport.send(request).await?;
        check_status(Provider::Twitter, &response, self.clock.now())?;

        match parse_body(Provider::Twitter, &response)? {
            Value::Array(items) => Ok(RawResponse::TimelineV1(items)),
            _ => Err(FeedError::MalformedResponse(
                "twitter: timeline is not an array".to_string(),
            )),
        }
    }
}

/// Index an `includes` array by one of its fields.
fn side_table(body: &Value, pointer: &str, key: &str) -> HashMap<String, Value> {
    body.pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get(key)?.as_str()?.to_string();
                    Some((id, item.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ProviderClient for TimelineClient {
    fn provider(&self) -> Provider {
        Provider::Twitter
    }

    async fn fetch_posts(&self, query: &FetchQuery) -> Result<Vec<Post>> {
        let count = query.bounded_count();
        info!(protocol = ?self.protocol, limit = count, "twitter: fetching timeline");

        let raw = match self.protocol {
            TimelineProtocol::V2 => self.fetch_v2(count).await?,
            TimelineProtocol::V1 => self.fetch_v1(count).await?,
        };

        let mut posts = dedup_by_id(raw.into_posts(query));
        posts.truncate(count as usize);
        Ok(posts)
    }
}
