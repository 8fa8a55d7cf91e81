//! One client per upstream platform behind the [`ProviderClient`] capability.

pub mod facebook;
pub mod instagram;
pub mod oauth1;
pub mod twitter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use socialfeed_common::{Config, Credential, FeedError, FetchQuery, Post, Provider, Result};
use socialfeed_http::{HttpResponse, HttpTransport};

use crate::clock::Clock;
use crate::tokens::FreshCredential;

pub use facebook::GraphClient;
pub use instagram::MediaClient;
pub use twitter::TimelineClient;

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Up to `query.count` normalized posts, newest first.
    async fn fetch_posts(&self, query: &FetchQuery) -> Result<Vec<Post>>;
}

/// Base URLs of every upstream API.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Graph root, used for page feeds.
    pub graph: String,
    /// Version segment for the Graph token endpoints.
    pub graph_version: String,
    /// Media listing and token refresh.
    pub media_graph: String,
    /// Media authorization-code exchange.
    pub media_auth: String,
    pub timeline: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            graph: "https://graph.facebook.com".to_string(),
            graph_version: "v15.0".to_string(),
            media_graph: "https://graph.instagram.com".to_string(),
            media_auth: "https://api.instagram.com".to_string(),
            timeline: "https://api.twitter.com".to_string(),
        }
    }
}

impl Endpoints {
    pub fn from_config(config: &Config) -> Self {
        Self {
            graph_version: config.graph_api_version.clone(),
            ..Self::default()
        }
    }

    pub fn graph_versioned(&self) -> String {
        format!("{}/{}", self.graph, self.graph_version)
    }
}

/// Build the client for a credential that has been through the token lifecycle.
pub fn build_client(
    fresh: &FreshCredential,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    endpoints: &Endpoints,
) -> Result<Box<dyn ProviderClient>> {
    Ok(match &fresh.credential {
        Credential::Facebook(_) => {
            let page = fresh.page.clone().ok_or_else(|| {
                FeedError::TokenExchange("no page token has been derived".to_string())
            })?;
            Box::new(GraphClient::new(transport, clock, endpoints, page))
        }
        Credential::Instagram(c) => Box::new(MediaClient::new(transport, clock, endpoints, c)),
        Credential::Twitter(c) => Box::new(TimelineClient::new(transport, clock, endpoints, c)?),
    })
}

// ---------------------------------------------------------------------------
// Status mapping shared by all clients
// ---------------------------------------------------------------------------

/// Map a non-2xx response onto the error taxonomy.
pub(crate) fn check_status(
    provider: Provider,
    response: &HttpResponse,
    now: DateTime<Utc>,
) -> Result<()> {
    match response.status {
        s if (200..300).contains(&s) => Ok(()),
        429 => Err(FeedError::RateLimited {
            provider,
            retry_after: retry_after(response, now),
        }),
        s if s >= 500 => Err(FeedError::Transient(format!(
            "{provider} returned {s}: {}",
            error_message(&response.body)
        ))),
        s => Err(FeedError::Upstream {
            status: s,
            message: error_message(&response.body),
        }),
    }
}

/// `retry-after` in seconds, else `x-rate-limit-reset` as an epoch timestamp.
fn retry_after(response: &HttpResponse, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(secs) = response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    let reset = response
        .header("x-rate-limit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    Some(Duration::from_secs(
        u64::try_from(reset - now.timestamp()).unwrap_or(0),
    ))
}

/// Best-effort error text from a JSON error body.
pub(crate) fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let from_json = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.pointer("/error_message"))
            .or_else(|| v.pointer("/errors/0/message"))
            .or_else(|| v.pointer("/detail"))
            .or_else(|| v.pointer("/title"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    from_json.unwrap_or_else(|| body.chars().take(200).collect())
}

/// Parse a successful body, or fail with `MalformedResponse`.
pub(crate) fn parse_body(provider: Provider, response: &HttpResponse) -> Result<Value> {
    serde_json::from_str(&response.body)
        .map_err(|e| FeedError::MalformedResponse(format!("{provider}: {e}")))
}

/// The `data` array of a list response.
pub(crate) fn data_array(provider: Provider, body: &mut Value) -> Result<Vec<Value>> {
    let data = body.get_mut("data").map(Value::take);
    match data {
        Some(Value::Array(items)) => Ok(items),
        Some(Value::Null) | None if body.get("meta").is_some() => Ok(Vec::new()),
        _ => Err(FeedError::MalformedResponse(format!(
            "{provider}: response has no data array"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn rate_limit_reads_retry_after() {
        let resp = HttpResponse::new(429, "").with_header("Retry-After", "30");
        match check_status(Provider::Twitter, &resp, now()) {
            Err(FeedError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_reads_reset_timestamp() {
        let resp = HttpResponse::new(429, "").with_header("x-rate-limit-reset", "1700000090");
        match check_status(Provider::Twitter, &resp, now()) {
            Err(FeedError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(90)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_transient_and_client_errors_are_upstream() {
        let resp = HttpResponse::new(503, "unavailable");
        assert!(matches!(
            check_status(Provider::Facebook, &resp, now()),
            Err(FeedError::Transient(_))
        ));

        let body = r#"{"error":{"message":"Invalid OAuth access token","code":190}}"#;
        match check_status(Provider::Facebook, &HttpResponse::new(400, body), now()) {
            Err(FeedError::Upstream { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid OAuth access token");
            }
            other => panic!("expected Upstream, got {other:?}"),
        }
    }

    #[test]
    fn data_array_tolerates_empty_timelines() {
        let mut empty_v2 = serde_json::json!({"meta": {"result_count": 0}});
        assert!(data_array(Provider::Twitter, &mut empty_v2).unwrap().is_empty());

        let mut junk = serde_json::json!({"unexpected": true});
        assert!(data_array(Provider::Twitter, &mut junk).is_err());
    }
}
