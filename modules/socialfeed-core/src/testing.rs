// Test doubles for the transport and clock ports.
//
// - MockTransport (HttpTransport): URL-prefix -> queued responses, records calls
// - ManualClock (Clock): time only moves when a test says so
//
// Plus credential and payload helpers shared by the integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use socialfeed_common::{FacebookCredential, InstagramCredential, TwitterCredential};
use socialfeed_http::{HttpRequest, HttpResponse, HttpTransport, TransportError};

use socialfeed_common::Config;

use crate::aggregator::FeedAggregator;
use crate::cache::MemoryCacheStore;
use crate::clock::Clock;
use crate::store::MemoryConfigStore;

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Responses are matched by the longest registered URL prefix. Each prefix
/// replays its queue in order and then keeps answering with the last one.
/// Unmatched URLs fail with a network error.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, url_prefix: &str, response: HttpResponse) -> Self {
        self.routes
            .lock()
            .unwrap()
            .entry(url_prefix.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn on_json(self, url_prefix: &str, body: Value) -> Self {
        self.on(url_prefix, HttpResponse::new(200, body.to_string()))
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Every request sent so far, in order.
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Requests whose URL starts with `url_prefix`.
    pub fn calls_to(&self, url_prefix: &str) -> Vec<HttpRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.url.starts_with(url_prefix))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> socialfeed_http::Result<HttpResponse> {
        self.calls.lock().unwrap().push(request.clone());

        let mut routes = self.routes.lock().unwrap();
        let prefix = routes
            .keys()
            .filter(|prefix| request.url.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())
            .cloned();

        let queue = prefix
            .and_then(|p| routes.get_mut(&p))
            .ok_or_else(|| TransportError::Network(format!("no mock response for {}", request.url)))?;
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        response.ok_or_else(|| TransportError::Network(format!("empty mock queue for {}", request.url)))
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// 2023-11-14T22:13:20Z.
    pub fn fixed() -> Self {
        Self::at(test_epoch())
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn test_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// An aggregator over the given doubles with default config and a memory cache.
pub fn aggregator(
    store: &MemoryConfigStore,
    transport: &Arc<MockTransport>,
    clock: &Arc<ManualClock>,
) -> FeedAggregator {
    FeedAggregator::new(
        &Config::default(),
        Arc::new(store.clone()),
        transport.clone(),
        clock.clone(),
        Arc::new(MemoryCacheStore::new(clock.clone())),
    )
}

pub fn facebook_credential() -> FacebookCredential {
    FacebookCredential {
        app_id: "app-1".into(),
        app_secret: "app-secret".into(),
        user_token: "short-user-token".into(),
        page_name: "corner-cafe".into(),
    }
}

pub fn instagram_credential() -> InstagramCredential {
    InstagramCredential {
        client_id: "ig-client".into(),
        client_secret: "ig-secret".into(),
        redirect_uri: "https://example.com/instagram/auth".into(),
        access_token: "ig-token".into(),
        ..Default::default()
    }
}

pub fn twitter_bearer_credential() -> TwitterCredential {
    TwitterCredential {
        bearer_token: "bearer".into(),
        user_id: "2244994945".into(),
        ..Default::default()
    }
}

pub fn twitter_legacy_credential() -> TwitterCredential {
    TwitterCredential {
        consumer_key: "ck".into(),
        consumer_secret: "cs".into(),
        access_token: "at".into(),
        access_token_secret: "ats".into(),
        ..Default::default()
    }
}

/// A store seeded with the global Graph credential.
pub fn facebook_store() -> MemoryConfigStore {
    let c = facebook_credential();
    MemoryConfigStore::new()
        .with("facebook.app_id", c.app_id)
        .with("facebook.secret_key", c.app_secret)
        .with("facebook.user_token", c.user_token)
        .with("facebook.page_name", c.page_name)
}

/// A store where the page token for `corner-cafe` was already derived.
pub fn facebook_store_with_page(page_id: &str, token: &str) -> MemoryConfigStore {
    facebook_store()
        .with("facebook.derived.corner-cafe.page_id", page_id)
        .with("facebook.derived.corner-cafe.page_permanent_token", token)
}

pub fn graph_item(id: &str, status_type: &str, picture: Option<&str>) -> Value {
    let mut item = json!({
        "id": id,
        "message": format!("post {id}"),
        "created_time": "2023-11-14T10:00:00+0000",
        "status_type": status_type,
        "permalink_url": format!("https://www.facebook.com/{id}"),
    });
    if let Some(picture) = picture {
        item["picture"] = json!(picture);
    }
    item
}

/// A Graph feed page; `next` becomes `paging.next`.
pub fn graph_page(items: Vec<Value>, next: Option<&str>) -> Value {
    match next {
        Some(next) => json!({"data": items, "paging": {"next": next}}),
        None => json!({"data": items}),
    }
}
