//! In-process stand-ins for the shared store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ttl_secs, SharedStore, StoreError};
use crate::clock::Clock;

/// A TTL-respecting map that behaves like a single shared store node.
///
/// Expiry is second-granular, like `SET EX`, and measured against the
/// supplied clock. The store can be switched offline to simulate an outage,
/// and given an artificial latency to exercise operation timeouts.
pub struct InMemoryStore {
    entries: DashMap<String, (String, i64)>,
    clock: Arc<dyn Clock>,
    online: AtomicBool,
    latency: Option<Duration>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            online: AtomicBool::new(true),
            latency: None,
        }
    }

    /// Delay every operation by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Take the store offline or bring it back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of keys that have not yet expired.
    pub fn live_keys(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.iter().filter(|e| e.value().1 > now).count()
    }

    /// Raw value lookup that bypasses availability and latency.
    pub fn raw(&self, key: &str) -> Option<String> {
        let now = self.clock.now_ms();
        self.entries
            .get(key)
            .filter(|e| e.value().1 > now)
            .map(|e| e.value().0.clone())
    }

    async fn enter(&self) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        }
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter().await?;
        let now = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.value().1 > now => return Ok(Some(entry.value().0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.enter().await?;
        let expires_at = self.clock.now_ms() + (ttl_secs(ttl) * 1000) as i64;
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.entries.remove(key);
        Ok(())
    }
}

/// A store that fails every operation, forcing callers onto their fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

#[async_trait]
impl SharedStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("no shared store configured".to_string()))
    }

    async fn set_ex(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("no shared store configured".to_string()))
    }

    async fn del(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("no shared store configured".to_string()))
    }
}
