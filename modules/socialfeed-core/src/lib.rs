pub mod aggregator;
pub mod cache;
pub mod clock;
pub mod flight;
pub mod providers;
pub mod raw;
pub mod resolver;
pub mod store;
pub mod tokens;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use aggregator::{FeedAggregator, FeedOutcome, FeedRequest, Origin};
pub use cache::{cache_key, CacheEntry, CacheStore, MemoryCacheStore, ResponseCache};
pub use clock::{Clock, SystemClock};
pub use providers::{Endpoints, GraphClient, MediaClient, ProviderClient, TimelineClient};
pub use raw::RawResponse;
pub use resolver::{resolve, validate};
pub use store::{ConfigStore, JsonFileConfigStore, MemoryConfigStore};
pub use tokens::{DerivedPage, FreshCredential, TokenLifecycleManager, TokenState};
