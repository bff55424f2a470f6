//! Remote key-value mirror for coordinator state
//!
//! The coordinator keeps sessions and transfers in memory; this crate is the
//! side channel those structures are mirrored into so other replicas and
//! operators can see them. It is never the source of truth.

pub mod keys;
pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Store-level errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Operations the coordinator needs from the mirror
///
/// Hash fields are plain strings; callers own the encoding.
#[async_trait]
pub trait RemoteStore: Send + Sync + Debug {
    /// Set one or more fields of a hash, creating it if needed
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    /// Remove a single field from a hash
    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<()>;

    /// All field/value pairs of a hash, in whatever order the store yields
    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>>;

    /// Set a plain key that expires after `ttl`
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Whether a key currently exists (expired keys do not)
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Delete a key of any kind
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Open a store from a URL
///
/// `memory` (or `memory://`) gives a process-local store; anything starting
/// with `redis://` connects to Redis. TLS (`rediss://`) is not supported.
pub async fn connect(url: &str) -> StoreResult<Arc<dyn RemoteStore>> {
    if url == "memory" || url.starts_with("memory://") {
        tracing::warn!("Using in-memory store; state is not shared across replicas");
        return Ok(Arc::new(MemoryStore::new()));
    }

    if url.starts_with("redis://") {
        let store = RedisStore::connect(url).await?;
        return Ok(Arc::new(store));
    }

    Err(StoreError::InvalidUrl(url.to_string()))
}
