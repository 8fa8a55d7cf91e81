use std::sync::Arc;

use serde::Serialize;
use socialfeed_common::{Config, Credential, FeedError, FetchQuery, Post, Provider, Result};
use socialfeed_http::{HttpTransport, ReqwestTransport};
use tracing::{debug, info, warn};

use crate::cache::{cache_key, CacheStore, MemoryCacheStore, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::providers::{build_client, Endpoints};
use crate::resolver::{load_global, load_query_defaults, resolve, validate};
use crate::store::ConfigStore;
use crate::tokens::TokenLifecycleManager;

/// One caller's ask: a provider, optionally with its own query and credentials.
#[derive(Debug, Clone)]
pub struct FeedRequest {
    pub provider: Provider,
    /// `None` uses the feed settings from the config store.
    pub query: Option<FetchQuery>,
    pub override_credential: Option<Credential>,
    pub override_enabled: bool,
}

impl FeedRequest {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            query: None,
            override_credential: None,
            override_enabled: false,
        }
    }

    pub fn with_query(mut self, query: FetchQuery) -> Self {
        self.provider = query.provider;
        self.query = Some(query);
        self
    }

    /// Layer `credential` over the stored one. Empty fields fall through.
    pub fn with_override(mut self, credential: Credential) -> Self {
        self.override_credential = Some(credential);
        self.override_enabled = true;
        self
    }
}

/// Where the posts of an outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Cache,
    Upstream,
    /// The provider failed; `posts` is empty and `error` says why.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct FeedOutcome {
    pub posts: Arc<Vec<Post>>,
    pub origin: Origin,
    /// The failure behind a degraded outcome, or a non-fatal warning.
    pub error: Option<FeedError>,
    /// Pass to [`FeedAggregator::stale`] to look for a stale copy.
    pub cache_key: String,
}

impl FeedOutcome {
    fn degraded(cache_key: String, error: FeedError) -> Self {
        Self {
            posts: Arc::new(Vec::new()),
            origin: Origin::Degraded,
            error: Some(error),
            cache_key,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.error.as_ref().is_some_and(FeedError::is_rate_limited)
    }
}

fn transition(provider: Provider, cache_key: &str, state: &'static str) {
    debug!(provider = %provider, cache_key, state, "feed transition");
}

pub struct FeedAggregator {
    store: Arc<dyn ConfigStore>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    endpoints: Endpoints,
    tokens: TokenLifecycleManager,
    cache: ResponseCache,
}

impl FeedAggregator {
    pub fn new(
        config: &Config,
        store: Arc<dyn ConfigStore>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        cache_store: Arc<dyn CacheStore>,
    ) -> Self {
        let endpoints = Endpoints::from_config(config);
        let tokens = TokenLifecycleManager::new(
            transport.clone(),
            store.clone(),
            clock.clone(),
            endpoints.clone(),
        )
        .with_policy(config.token_lifetime_days, config.refresh_window_days);
        let cache = ResponseCache::new(cache_store, clock.clone(), config.stale_grace);

        Self {
            store,
            transport,
            clock,
            endpoints,
            tokens,
            cache,
        }
    }

    /// Real transport, system clock and an in-process cache.
    pub fn from_config(config: &Config, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let transport = ReqwestTransport::new(config.http_timeout, &config.user_agent)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache_store = Arc::new(MemoryCacheStore::new(clock.clone()));
        Ok(Self::new(config, store, Arc::new(transport), clock, cache_store))
    }

    pub fn tokens(&self) -> &TokenLifecycleManager {
        &self.tokens
    }

    /// Run one aggregation.
    ///
    /// Returns `Err` only when no usable credential exists or the config store
    /// fails. Provider failures come back as a degraded outcome.
    pub async fn fetch(&self, request: &FeedRequest) -> Result<FeedOutcome> {
        let provider = request.provider;
        transition(provider, "", "resolve_credentials");

        let global = load_global(self.store.as_ref(), provider).await?;
        let credential = resolve(
            &global,
            request.override_credential.as_ref(),
            request.override_enabled,
        )?;
        validate(&credential)?;

        let query = match &request.query {
            Some(query) => query.clone(),
            None => load_query_defaults(self.store.as_ref(), provider).await?,
        };
        // Pre-refresh key, read only when the token lifecycle fails.
        let resolved_key = cache_key(&query, &credential);

        transition(provider, &resolved_key, "ensure_token_fresh");
        let fresh = match self.tokens.ensure_fresh(&credential).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_recoverable() => {
                warn!(provider = %provider, error = %e, "Token lifecycle failed");
                let key = resolved_key;
                return Ok(match self.cache.fresh(&key).await {
                    Some(posts) => {
                        transition(provider, &key, "done");
                        FeedOutcome {
                            posts,
                            origin: Origin::Cache,
                            error: Some(e),
                            cache_key: key,
                        }
                    }
                    None => {
                        transition(provider, &key, "failed");
                        FeedOutcome::degraded(key, e)
                    }
                });
            }
            Err(e) => return Err(e),
        };

        // Keyed by the token actually used, so a refresh does not orphan the entry.
        let key = cache_key(&query, &fresh.credential);

        transition(provider, &key, "check_cache");
        if let Some(posts) = self.cache.fresh(&key).await {
            transition(provider, &key, "done");
            return Ok(FeedOutcome {
                posts,
                origin: Origin::Cache,
                error: fresh.warning,
                cache_key: key,
            });
        }

        transition(provider, &key, "fetch");
        let client = match build_client(
            &fresh,
            self.transport.clone(),
            self.clock.clone(),
            &self.endpoints,
        ) {
            Ok(client) => client,
            Err(e) if e.is_recoverable() => {
                transition(provider, &key, "failed");
                return Ok(FeedOutcome::degraded(key, e));
            }
            Err(e) => return Err(e),
        };

        let fetched = self
            .cache
            .get_or_fetch(&key, query.cache_ttl, || async {
                let posts = client.fetch_posts(&query).await?;
                transition(provider, &key, "normalize");
                if !posts.is_empty() {
                    transition(provider, &key, "store_cache");
                }
                Ok::<_, FeedError>(posts)
            })
            .await;

        match fetched {
            Ok(posts) => {
                transition(provider, &key, "done");
                info!(provider = %provider, count = posts.len(), "Feed fetched");
                Ok(FeedOutcome {
                    posts,
                    origin: Origin::Upstream,
                    error: fresh.warning,
                    cache_key: key,
                })
            }
            Err(e) if e.is_recoverable() => {
                transition(provider, &key, "failed");
                warn!(provider = %provider, error = %e, "Feed fetch failed");
                Ok(FeedOutcome::degraded(key, e))
            }
            Err(e) => Err(e),
        }
    }

    /// A retained copy past its TTL, for callers that serve stale data when
    /// rate limited.
    pub async fn stale(&self, cache_key: &str) -> Option<Arc<Vec<Post>>> {
        self.cache.stale(cache_key).await
    }

    pub async fn invalidate(&self, cache_key: &str) {
        self.cache.invalidate(cache_key).await;
    }
}
