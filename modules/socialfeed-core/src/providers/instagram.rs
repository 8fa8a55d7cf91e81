// User media listing: a single call, no pagination.

use std::sync::Arc;

use async_trait::async_trait;
use socialfeed_common::{dedup_by_id, FetchQuery, InstagramCredential, Post, Provider, Result};
use socialfeed_http::{HttpRequest, HttpTransport};
use tracing::info;

use super::{check_status, data_array, parse_body, Endpoints, ProviderClient};
use crate::clock::Clock;
use crate::raw::RawResponse;

const FIELDS: &str = "id,caption,media_type,media_url,permalink,thumbnail_url,timestamp,username";

pub struct MediaClient {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    media_url: String,
    access_token: String,
}

impl MediaClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        endpoints: &Endpoints,
        credential: &InstagramCredential,
    ) -> Self {
        let user_id = if credential.user_id.is_empty() {
            "me"
        } else {
            credential.user_id.as_str()
        };
        Self {
            transport,
            clock,
            media_url: format!("{}/{}/media", endpoints.media_graph, user_id),
            access_token: credential.access_token.clone(),
        }
    }
}

#[async_trait]
impl ProviderClient for MediaClient {
    fn provider(&self) -> Provider {
        Provider::Instagram
    }

    async fn fetch_posts(&self, query: &FetchQuery) -> Result<Vec<Post>> {
        let count = query.bounded_count();
        info!(limit = count, "instagram: fetching media");

        let request = HttpRequest::get(&self.media_url)
            .query("fields", FIELDS)
            .query("access_token", &self.access_token)
            .query("limit", count.to_string());
        let response = self.transport.send(request).await?;
        check_status(Provider::Instagram, &response, self.clock.now())?;

        let mut body = parse_body(Provider::Instagram, &response)?;
        let items = data_array(Provider::Instagram, &mut body)?;

        let mut posts = dedup_by_id(RawResponse::TokenMedia(items).into_posts(query));
        posts.truncate(count as usize);
        Ok(posts)
    }
}
