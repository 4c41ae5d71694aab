//! TTL-keyed cache store shared by all concurrent tasks.
//!
//! The store is the single source of truth for in-flight domain workflows.
//! Because two independent tasks (poller, issuance supervisor) each hold
//! their own copy of a record fetched at different times, every mutation
//! follows read-fresh / mutate / write-back; there is no locking and the
//! last write wins. The writers touch disjoint fields, so both converge to a
//! consistent terminal state.
//!
//! Values are opaque byte blobs; callers own the serialization.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Cache store errors.
///
/// `NotFound` is the expected get-or-create signal, not a failure: callers
/// match on it without logging an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key '{key}' does not exist in cache")]
    NotFound { key: String },

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("failed to serialize cached value: {0}")]
    Serialization(String),
}

/// Keyed object store with per-key expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the value for `key`. A missing or expired key is
    /// [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Store `value` under `key`, expiring after `ttl_secs`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), StoreError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop all keys. Run once at startup: workflow state is process-scoped
    /// and must not leak across restarts of the agent host.
    async fn flush_all(&self) -> Result<(), StoreError>;
}
