use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use socialfeed_common::{FeedError, Result};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Durable key/value configuration. Holds provider credentials, feed
/// defaults and every token derived or refreshed at runtime.
///
/// `set` and `remove` only stage a change; `save` makes staged changes durable.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn save(&self) -> Result<()>;
}

/// Reads a key and treats an empty string as absent.
pub(crate) async fn get_non_empty(store: &dyn ConfigStore, key: &str) -> Result<Option<String>> {
    Ok(store.get(key).await?.filter(|v| !v.is_empty()))
}

// ---------------------------------------------------------------------------
// MemoryConfigStore
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct MemoryConfigStore {
    values: Arc<DashMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Current value, bypassing the async port. Handy for assertions.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileConfigStore
// ---------------------------------------------------------------------------

/// A flat JSON object on disk. Scalars that are not strings are read back as
/// their JSON text, so `{"twitter.tweets_count": 5}` works as expected.
pub struct JsonFileConfigStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
    /// Held from snapshot to rename so saves land in the order they snapshot.
    saving: Mutex<()>,
}

impl JsonFileConfigStore {
    /// Open the file at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => parse_flat_object(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(store_error(&path, e)),
        };
        debug!(path = %path.display(), keys = values.len(), "Opened config store");

        Ok(Self {
            path,
            values: RwLock::new(values),
            saving: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_flat_object(text: &str) -> Result<BTreeMap<String, String>> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(text).map_err(|e| FeedError::Store(format!("invalid config file: {e}")))?;

    Ok(object
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(s) => Some((key, s)),
            serde_json::Value::Null => None,
            other => Some((key, other.to_string())),
        })
        .collect())
}

fn store_error(path: &Path, err: std::io::Error) -> FeedError {
    FeedError::Store(format!("{}: {err}", path.display()))
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let _saving = self.saving.lock().await;
        let text = {
            let values = self.values.read().await;
            serde_json::to_string_pretty(&*values).map_err(|e| FeedError::Store(e.to_string()))?
        };

        // Write next to the target and rename over it.
        let tmp = self.path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| store_error(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(store_error(&self.path, e));
        }

        debug!(path = %self.path.display(), "Saved config store");
        Ok(())
    }
}
