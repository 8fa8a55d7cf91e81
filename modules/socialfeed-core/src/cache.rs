//! Post-list cache with single-flight fills.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use socialfeed_common::{Credential, FetchQuery, Post, Result};
use tracing::debug;

use crate::clock::{to_chrono, Clock};
use crate::flight::SingleFlight;

/// A cached post list. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub posts: Arc<Vec<Post>>,
    pub fresh_until: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.fresh_until
    }
}

/// Storage behind [`ResponseCache`]. An entry is kept for `retain_for` after
/// it is set; freshness is the cache's concern, not the store's.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: &str, entry: CacheEntry, retain_for: Duration);
    async fn remove(&self, key: &str);
}

/// Cache key for a provider query under one credential. Only the credential's
/// fingerprint goes into the hash.
pub fn cache_key(query: &FetchQuery, credential: &Credential) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.provider.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(query.normalized().as_bytes());
    hasher.update([0x1f]);
    hasher.update(credential.fingerprint().as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

/// Minimum spacing between full sweeps of expired entries.
const SWEEP_INTERVAL_SECS: i64 = 60;

struct Retained {
    entry: CacheEntry,
    retain_until: DateTime<Utc>,
}

/// In-process store. Entries past their retention are dropped on read, and
/// every write sweeps the whole map when the last sweep is a minute old.
pub struct MemoryCacheStore {
    entries: DashMap<String, Retained>,
    clock: Arc<dyn Clock>,
    last_sweep: AtomicI64,
}

impl MemoryCacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now().timestamp();
        Self {
            entries: DashMap::new(),
            clock,
            last_sweep: AtomicI64::new(now),
        }
    }

    fn sweep_expired(&self, now: DateTime<Utc>) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.timestamp() - last < SWEEP_INTERVAL_SECS {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now.timestamp(), Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let before = self.entries.len();
        self.entries.retain(|_, r| now < r.retain_until);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "cache sweep");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(retained) if now < retained.retain_until => return Some(retained.entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, r| now >= r.retain_until);
        }
        None
    }

    async fn set(&self, key: &str, entry: CacheEntry, retain_for: Duration) {
        let now = self.clock.now();
        self.sweep_expired(now);
        let retain_until = now + to_chrono(retain_for);
        self.entries.insert(
            key.to_string(),
            Retained {
                entry,
                retain_until,
            },
        );
    }

    async fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

// ---------------------------------------------------------------------------
// ResponseCache
// ---------------------------------------------------------------------------

pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    fills: SingleFlight<Arc<Vec<Post>>>,
    stale_grace: Duration,
}

impl ResponseCache {
    /// `stale_grace` is how long an entry outlives its TTL for [`ResponseCache::stale`].
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, stale_grace: Duration) -> Self {
        Self {
            store,
            clock,
            fills: SingleFlight::new(),
            stale_grace,
        }
    }

    /// The fresh entry for `key`, if any.
    pub async fn fresh(&self, key: &str) -> Option<Arc<Vec<Post>>> {
        self.store
            .get(key)
            .await
            .filter(|entry| entry.is_fresh(self.clock.now()))
            .map(|entry| entry.posts)
    }

    /// An entry past its TTL but still retained.
    pub async fn stale(&self, key: &str) -> Option<Arc<Vec<Post>>> {
        self.store
            .get(key)
            .await
            .filter(|entry| !entry.is_fresh(self.clock.now()))
            .map(|entry| entry.posts)
    }

    pub async fn invalidate(&self, key: &str) {
        self.store.remove(key).await;
    }

    /// The cached list for `key`, or the result of `fetch`. Concurrent misses
    /// on one key share a single `fetch`. Only non-empty successes are stored.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<Arc<Vec<Post>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Post>>>,
    {
        if let Some(posts) = self.fresh(key).await {
            debug!(cache_key = key, "cache hit");
            return Ok(posts);
        }

        self.fills
            .run(key, || async {
                if let Some(posts) = self.fresh(key).await {
                    return Ok(posts);
                }

                let posts = Arc::new(fetch().await?);
                if posts.is_empty() {
                    debug!(cache_key = key, "empty result not cached");
                    return Ok(posts);
                }

                let entry = CacheEntry {
                    posts: posts.clone(),
                    fresh_until: self.clock.now() + to_chrono(ttl),
                };
                self.store.set(key, entry, ttl + self.stale_grace).await;
                debug!(cache_key = key, count = posts.len(), "cache filled");
                Ok(posts)
            })
            .await
    }
}
