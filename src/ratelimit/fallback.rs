//! Process-local window store used while the shared store is unreachable.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::entry::{admit, RateLimitDecision, RateLimitEntry};
use super::rules::RateLimitConfig;
use crate::clock::Clock;

/// In-memory map of store key to window, guarded by a single lock.
///
/// The lock is held for the whole read-increment-write of a check and is
/// never held across an await point.
#[derive(Debug, Default)]
pub struct FallbackStore {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl FallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one hit to `key` and return the decision.
    pub fn check(&self, key: &str, now_ms: i64, config: &RateLimitConfig) -> RateLimitDecision {
        let mut entries = self.entries.lock();
        let admission = admit(entries.get(key).copied(), now_ms, config);
        if let Some(entry) = admission.write {
            if entry.count == 1 {
                debug!(key = %key, reset_time = entry.reset_time, "Opened local window");
            }
            entries.insert(key.to_string(), entry);
        }
        admission.decision
    }

    /// Current window for `key`, if one exists.
    pub fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.lock().get(key).copied()
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Number of tracked keys, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every window that has closed.
    ///
    /// Returns `None` without waiting when the map is busy, so a sweep never
    /// delays an admission check.
    pub fn sweep(&self, now_ms: i64) -> Option<usize> {
        let mut entries = self.entries.try_lock()?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now_ms));
        Some(before - entries.len())
    }

    /// Run [`sweep`](Self::sweep) every `every` until the store is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        clock: Arc<dyn Clock>,
        every: Duration,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                match store.sweep(clock.now_ms()) {
                    Some(0) => trace!("Fallback sweep found nothing to remove"),
                    Some(removed) => debug!(removed, "Swept expired fallback windows"),
                    None => trace!("Fallback store busy, skipping sweep"),
                }
            }
        })
    }
}
