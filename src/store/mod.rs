//! Shared key-value store abstraction.
//!
//! Limiter and cooldown state lives in a store shared by every running
//! instance. The store is only known through the [`SharedStore`] trait so the
//! degraded path can be exercised without a live service.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::{InMemoryStore, UnavailableStore};
pub use self::redis::RedisStore;

/// Errors that can occur talking to the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("failed to decode stored value: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Minimal `GET` / `SET EX` / `DEL` contract over string keys.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value, `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a key. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// Bound a store operation by `limit`, mapping expiry to [`StoreError::Timeout`].
pub(crate) async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Round a TTL up to whole seconds, never below one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}
