use std::sync::Arc;

use serde_json::json;
use socialfeed_common::{FeedError, FetchQuery, MediaType, PostTypeFilter, Provider};
use socialfeed_core::testing::*;
use socialfeed_core::{
    ConfigStore, DerivedPage, Endpoints, FeedRequest, GraphClient, MemoryConfigStore, Origin,
    ProviderClient, TokenLifecycleManager,
};
use socialfeed_http::HttpResponse;

const FEED: &str = "https://graph.facebook.com/page-9/feed";
const GRAPH: &str = "https://graph.facebook.com/v15.0";

fn client(transport: &Arc<MockTransport>) -> GraphClient {
    GraphClient::new(
        transport.clone(),
        Arc::new(ManualClock::fixed()),
        &Endpoints::default(),
        DerivedPage {
            page_id: "page-9".into(),
            access_token: "perm".into(),
        },
    )
}

fn exchange_routes(transport: MockTransport) -> MockTransport {
    transport
        .on_json(&format!("{GRAPH}/oauth/access_token"), json!({"access_token": "long"}))
        .on_json(&format!("{GRAPH}/me"), json!({"id": "acct-1"}))
        .on_json(&format!("{GRAPH}/corner-cafe"), json!({"id": "page-9"}))
        .on_json(
            &format!("{GRAPH}/acct-1/accounts"),
            json!({"data": [
                {"id": "other-page", "access_token": "wrong"},
                {"id": "page-9", "access_token": "perm"}
            ]}),
        )
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stops_paging_once_count_is_reached() {
    let transport = MockTransport::new()
        .on_json(
            FEED,
            graph_page(
                vec![graph_item("1", "status", None), graph_item("2", "status", None)],
                Some(&format!("{FEED}?after=p2")),
            ),
        )
        .on_json(
            &format!("{FEED}?after=p2"),
            graph_page(
                vec![graph_item("3", "status", None), graph_item("4", "status", None)],
                Some(&format!("{FEED}?after=p3")),
            ),
        )
        .on_json(
            &format!("{FEED}?after=p3"),
            graph_page(vec![graph_item("5", "status", None)], None),
        )
        .into_arc();

    let posts = client(&transport)
        .fetch_posts(&FetchQuery::new(Provider::Facebook, 3))
        .await
        .unwrap();

    let ids: Vec<_> = posts.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(transport.call_count(), 2);

    let first = &transport.calls()[0];
    assert_eq!(first.query_param("limit"), Some("3"));
    assert_eq!(first.query_param("access_token"), Some("perm"));
    assert!(first.query_param("fields").unwrap().contains("status_type"));
}

#[tokio::test]
async fn stops_when_the_cursor_runs_out() {
    let transport = MockTransport::new()
        .on_json(
            FEED,
            graph_page(
                vec![graph_item("1", "status", None), graph_item("2", "status", None)],
                Some(&format!("{FEED}?after=p2")),
            ),
        )
        .on_json(
            &format!("{FEED}?after=p2"),
            graph_page(vec![graph_item("3", "status", None)], None),
        )
        .into_arc();

    let posts = client(&transport)
        .fetch_posts(&FetchQuery::new(Provider::Facebook, 10))
        .await
        .unwrap();

    assert_eq!(posts.len(), 3);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn filter_drops_items_without_matching_status_type() {
    let mut untyped = graph_item("2", "status", None);
    untyped.as_object_mut().unwrap().remove("status_type");

    let transport = MockTransport::new()
        .on_json(
            FEED,
            graph_page(
                vec![
                    graph_item("1", "added_photos", Some("https://cdn.example.com/1.jpg")),
                    untyped,
                    graph_item("3", "shared_story", None),
                ],
                None,
            ),
        )
        .into_arc();

    let query = FetchQuery::new(Provider::Facebook, 5)
        .post_type(PostTypeFilter::Only("added_photos".into()));
    let posts = client(&transport).fetch_posts(&query).await.unwrap();

    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].id, "1");
}

#[tokio::test]
async fn graph_errors_are_mapped() {
    let transport = MockTransport::new()
        .on(
            FEED,
            HttpResponse::new(400, r#"{"error":{"message":"Unsupported get request"}}"#),
        )
        .into_arc();

    let err = client(&transport)
        .fetch_posts(&FetchQuery::new(Provider::Facebook, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Upstream { status: 400, .. }));
}

// ---------------------------------------------------------------------------
// Page token derivation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn derives_and_persists_the_page_token_once() {
    let store = facebook_store();
    let transport = exchange_routes(MockTransport::new()).into_arc();
    let tokens = TokenLifecycleManager::new(
        transport.clone(),
        Arc::new(store.clone()),
        Arc::new(ManualClock::fixed()),
        Endpoints::default(),
    );

    let page = tokens.ensure_derived(&facebook_credential()).await.unwrap();
    assert_eq!(page.page_id, "page-9");
    assert_eq!(page.access_token, "perm");
    assert_eq!(transport.call_count(), 4);

    let exchange = &transport.calls()[0];
    assert_eq!(exchange.query_param("grant_type"), Some("fb_exchange_token"));
    assert_eq!(exchange.query_param("fb_exchange_token"), Some("short-user-token"));
    assert_eq!(
        store.peek("facebook.derived.corner-cafe.page_permanent_token").as_deref(),
        Some("perm")
    );

    let again = tokens.ensure_derived(&facebook_credential()).await.unwrap();
    assert_eq!(again, page);
    assert_eq!(transport.call_count(), 4);
}

#[tokio::test]
async fn page_id_survives_a_failed_token_lookup() {
    let store = facebook_store();
    let transport = MockTransport::new()
        .on_json(&format!("{GRAPH}/oauth/access_token"), json!({"access_token": "long"}))
        .on_json(&format!("{GRAPH}/me"), json!({"id": "acct-1"}))
        .on_json(&format!("{GRAPH}/corner-cafe"), json!({"id": "page-9"}))
        .on_json(&format!("{GRAPH}/acct-1/accounts"), json!({"data": []}))
        .into_arc();
    let tokens = TokenLifecycleManager::new(
        transport.clone(),
        Arc::new(store.clone()),
        Arc::new(ManualClock::fixed()),
        Endpoints::default(),
    );

    let err = tokens.ensure_derived(&facebook_credential()).await.unwrap_err();
    assert!(matches!(err, FeedError::TokenExchange(_)));
    assert_eq!(store.peek("facebook.derived.corner-cafe.page_id").as_deref(), Some("page-9"));
    assert_eq!(store.peek("facebook.derived.corner-cafe.page_permanent_token"), None);

    // The persisted page id skips the lookup next time.
    let _ = tokens.ensure_derived(&facebook_credential()).await;
    assert_eq!(transport.calls_to(&format!("{GRAPH}/corner-cafe")).len(), 1);
}

#[tokio::test]
async fn concurrent_derivations_share_one_exchange() {
    let store = facebook_store();
    let transport = exchange_routes(MockTransport::new()).into_arc();
    let tokens = TokenLifecycleManager::new(
        transport.clone(),
        Arc::new(store.clone()),
        Arc::new(ManualClock::fixed()),
        Endpoints::default(),
    );
    let credential = facebook_credential();

    let results =
        futures::future::join_all((0..4).map(|_| tokens.ensure_derived(&credential))).await;

    for result in results {
        assert_eq!(result.unwrap().access_token, "perm");
    }
    assert_eq!(transport.call_count(), 4);
    assert_eq!(transport.calls_to(&format!("{GRAPH}/oauth/access_token")).len(), 1);
}

#[tokio::test]
async fn rate_limited_exchange_stays_rate_limited() {
    let store = facebook_store();
    let transport = MockTransport::new()
        .on(
            &format!("{GRAPH}/oauth/access_token"),
            HttpResponse::new(429, r#"{"error": {"message": "slow down"}}"#)
                .with_header("Retry-After", "120"),
        )
        .into_arc();
    let clock = Arc::new(ManualClock::fixed());
    let feed = aggregator(&store, &transport, &clock);

    let outcome = feed.fetch(&FeedRequest::new(Provider::Facebook)).await.unwrap();

    assert_eq!(outcome.origin, Origin::Degraded);
    assert!(outcome.is_rate_limited());
    match outcome.error {
        Some(FeedError::RateLimited {
            provider,
            retry_after,
        }) => {
            assert_eq!(provider, Provider::Facebook);
            assert_eq!(retry_after, Some(std::time::Duration::from_secs(120)));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    assert_eq!(transport.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn photo_feed_end_to_end() {
    let store = facebook_store();
    let transport = exchange_routes(MockTransport::new())
        .on_json(
            FEED,
            graph_page(
                vec![
                    graph_item("p1", "photo", Some("https://cdn.example.com/p1.jpg")),
                    graph_item("s1", "status", None),
                ],
                Some(&format!("{FEED}?after=p2")),
            ),
        )
        .on_json(
            &format!("{FEED}?after=p2"),
            graph_page(vec![graph_item("p2", "photo", None)], None),
        )
        .into_arc();
    let clock = Arc::new(ManualClock::fixed());
    let feed = aggregator(&store, &transport, &clock);

    let query = FetchQuery::new(Provider::Facebook, 3).post_type(PostTypeFilter::Only("photo".into()));
    let outcome = feed
        .fetch(&FeedRequest::new(Provider::Facebook).with_query(query))
        .await
        .unwrap();

    assert_eq!(outcome.origin, Origin::Upstream);
    assert!(outcome.error.is_none());
    let ids: Vec<_> = outcome.posts.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2"]);
    assert!(outcome.posts.iter().all(|p| p.media_type == MediaType::Image));
    assert_eq!(transport.calls_to(FEED).len(), 2);
}

#[tokio::test]
async fn failed_exchange_degrades_but_cache_still_answers() {
    let store = facebook_store_with_page("page-9", "perm");
    let transport = MockTransport::new()
        .on_json(FEED, graph_page(vec![graph_item("1", "status", None)], None))
        .into_arc();
    let clock = Arc::new(ManualClock::fixed());
    let feed = aggregator(&store, &transport, &clock);
    let request = FeedRequest::new(Provider::Facebook);

    let first = feed.fetch(&request).await.unwrap();
    assert_eq!(first.origin, Origin::Upstream);

    // Lose the derived token; the exchange endpoints are not mocked.
    store
        .set("facebook.derived.corner-cafe.page_permanent_token", String::new())
        .await
        .unwrap();

    let second = feed.fetch(&request).await.unwrap();
    assert_eq!(second.origin, Origin::Cache);
    assert_eq!(second.posts.len(), 1);
    assert!(matches!(second.error, Some(FeedError::TokenExchange(_))));

    feed.invalidate(&second.cache_key).await;
    let third = feed.fetch(&request).await.unwrap();
    assert_eq!(third.origin, Origin::Degraded);
    assert!(third.posts.is_empty());
    assert!(matches!(third.error, Some(FeedError::TokenExchange(_))));
}

#[tokio::test]
async fn missing_credentials_fail_before_any_call() {
    let store = MemoryConfigStore::new().with("facebook.app_id", "app-1");
    let transport = MockTransport::new().into_arc();
    let clock = Arc::new(ManualClock::fixed());
    let feed = aggregator(&store, &transport, &clock);

    let err = feed.fetch(&FeedRequest::new(Provider::Facebook)).await.unwrap_err();
    match err {
        FeedError::ConfigIncomplete { provider, missing } => {
            assert_eq!(provider, Provider::Facebook);
            assert_eq!(missing, vec!["app_secret", "user_token", "page_name"]);
        }
        other => panic!("expected ConfigIncomplete, got {other:?}"),
    }
    assert_eq!(transport.call_count(), 0);
}
