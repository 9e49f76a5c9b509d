//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::entry::{admit, RateLimitDecision, RateLimitEntry, RateLimitKey};
use super::fallback::FallbackStore;
use super::rules::RateLimitConfig;
use crate::clock::Clock;
use crate::store::{bounded, SharedStore, StoreError};

/// Default bound on a single shared store operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// Extra lifetime given to shared entries past the end of their window.
///
/// The stored `resetTime` decides when a window closes; the store TTL only
/// has to make sure the entry outlives it.
const TTL_GRACE: Duration = Duration::from_secs(1);

/// Fixed-window rate limiter backed by a shared store.
///
/// Any shared store failure sends the same check to the local
/// [`FallbackStore`], so a decision is always produced.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    fallback: Arc<FallbackStore>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            fallback: Arc::new(FallbackStore::new()),
            clock,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Override the per-operation shared store timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn fallback(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }

    /// Start the periodic sweep of the fallback store.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.fallback.spawn_sweeper(self.clock.clone(), every)
    }

    /// Count one hit against `key` and decide whether it is admitted.
    pub async fn check(&self, key: &RateLimitKey, config: &RateLimitConfig) -> RateLimitDecision {
        let store_key = key.to_store_key();
        let now = self.clock.now_ms();

        trace!(key = %store_key, max = config.max, window_ms = config.window_ms, "Checking rate limit");

        let decision = match self.check_shared(&store_key, now, config).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(key = %store_key, error = %e, "Shared store unavailable, using local fallback");
                self.fallback.check(&store_key, now, config)
            }
        };

        if decision.limited {
            debug!(key = %store_key, reset_time = ?decision.reset_time, "Rate limit exceeded");
        }

        decision
    }

    async fn check_shared(
        &self,
        key: &str,
        now: i64,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, StoreError> {
        let current = match bounded(self.operation_timeout, self.store.get(key)).await? {
            Some(raw) => Some(serde_json::from_str::<RateLimitEntry>(&raw)?),
            None => None,
        };

        let admission = admit(current, now, config);
        if let Some(entry) = admission.write {
            if entry.count == 1 {
                debug!(key = %key, reset_time = entry.reset_time, "Opened shared window");
            }
            let ttl = entry.remaining(now) + TTL_GRACE;
            let payload = serde_json::to_string(&entry)?;
            bounded(self.operation_timeout, self.store.set_ex(key, payload, ttl)).await?;
        }

        Ok(admission.decision)
    }

    /// Forget the window for `key` in both stores.
    pub async fn reset(&self, key: &RateLimitKey) {
        let store_key = key.to_store_key();
        if let Err(e) = bounded(self.operation_timeout, self.store.del(&store_key)).await {
            warn!(key = %store_key, error = %e, "Failed to reset shared rate limit entry");
        }
        self.fallback.remove(&store_key);
        debug!(key = %store_key, "Rate limit reset");
    }

    /// Read the current window for `key` without counting a hit.
    pub async fn peek(&self, key: &RateLimitKey) -> Option<RateLimitEntry> {
        let store_key = key.to_store_key();
        let shared = match bounded(self.operation_timeout, self.store.get(&store_key)).await {
            Ok(raw) => raw.map(|raw| serde_json::from_str::<RateLimitEntry>(&raw)),
            Err(e) => {
                trace!(key = %store_key, error = %e, "Peeking local fallback");
                return self.fallback.get(&store_key);
            }
        };
        match shared {
            Some(Ok(entry)) => Some(entry),
            Some(Err(e)) => {
                warn!(key = %store_key, error = %e, "Undecodable shared rate limit entry");
                self.fallback.get(&store_key)
            }
            None => None,
        }
    }
}
