//! In-memory cache store with per-entry TTL.
//!
//! Single-process stand-in for the redis backend, used by tests and by
//! deployments without a reachable redis instance. Expiry is checked lazily
//! on access and swept by a background task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CacheStore, StoreError};

/// Sweep cadence for expired entries.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory TTL store backed by a concurrent map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Create a store with a background sweep of expired entries.
    ///
    /// Lazy expiry on `get` is enough for correctness; the sweep only bounds
    /// memory held by keys nobody reads again.
    pub fn with_cleanup_task() -> Self {
        let store = Self::new();
        let entries = Arc::clone(&store.entries);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let before = entries.len();
                entries.retain(|_, entry| entry.expires_at > now);
                let removed = before - entries.len();
                if removed > 0 {
                    debug!(removed = removed, "Swept expired cache entries");
                }
            }
        });
        store
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.value.clone()),
            Some(_) => {
                drop(self.entries.remove(key));
                Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }
}
