// Graph page feed: follows `paging.next` until enough posts are collected.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use socialfeed_common::{FetchQuery, Post, Provider, Result};
use socialfeed_http::{HttpRequest, HttpTransport};
use tracing::{debug, info, warn};

use super::{check_status, data_array, parse_body, Endpoints, ProviderClient};
use crate::clock::Clock;
use crate::raw::{graph_status_type, RawResponse};
use crate::tokens::DerivedPage;

const FIELDS: &str = "created_time,message,permalink_url,picture,status_type,from";

/// Upper bound on pages walked for one query, for feeds where the filter
/// rejects nearly everything.
const MAX_PAGES: usize = 25;

pub struct GraphClient {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    feed_url: String,
    page: DerivedPage,
}

impl GraphClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        endpoints: &Endpoints,
        page: DerivedPage,
    ) -> Self {
        let feed_url = format!("{}/{}/feed", endpoints.graph, page.page_id);
        Self {
            transport,
            clock,
            feed_url,
            page,
        }
    }

    async fn fetch_page(&self, request: HttpRequest) -> Result<(Vec<Value>, Option<String>)> {
        let response = self.transport.send(request).await?;
        check_status(Provider::Facebook, &response, self.clock.now())?;

        let mut body = parse_body(Provider::Facebook, &response)?;
        let items = data_array(Provider::Facebook, &mut body)?;
        let next = body
            .pointer("/paging/next")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok((items, next))
    }
}

#[async_trait]
impl ProviderClient for GraphClient {
    fn provider(&self) -> Provider {
        Provider::Facebook
    }

    async fn fetch_posts(&self, query: &FetchQuery) -> Result<Vec<Post>> {
        let count = query.bounded_count();
        let wanted = count as usize;
        info!(page_id = self.page.page_id.as_str(), limit = count, "facebook: fetching posts");

        let mut request = HttpRequest::get(&self.feed_url)
            .query("access_token", &self.page.access_token)
            .query("fields", FIELDS)
            .query("limit", count.to_string());

        let mut posts: Vec<Post> = Vec::with_capacity(wanted);
        let mut seen = HashSet::new();
        let mut pages = 0;

        loop {
            let (items, next) = self.fetch_page(request).await?;
            pages += 1;

            let kept: Vec<Value> = items
                .into_iter()
                .filter(|item| query.post_type_filter.matches(graph_status_type(item)))
                .collect();
            for post in RawResponse::GraphStyle(kept).into_posts(query) {
                if seen.insert(post.id.clone()) {
                    posts.push(post);
                }
            }
            debug!(page = pages, collected = posts.len(), "facebook: feed page read");

            if posts.len() >= wanted {
                break;
            }
            match next {
                Some(url) if pages < MAX_PAGES => request = HttpRequest::get(url),
                Some(_) => {
                    warn!(pages, collected = posts.len(), "facebook: page limit reached");
                    break;
                }
                None => break,
            }
        }

        posts.truncate(wanted);
        Ok(posts)
    }
}
