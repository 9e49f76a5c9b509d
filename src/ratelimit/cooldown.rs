//! Per-command, per-user cooldowns.
//!
//! Cooldowns are advisory. They live only in the shared store and a store
//! failure lets the command through.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::limiter::DEFAULT_OPERATION_TIMEOUT;
use crate::clock::Clock;
use crate::store::{bounded, SharedStore};

/// Whether a user may run a command again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownStatus {
    Ready,
    Active { remaining: Duration },
}

impl CooldownStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, CooldownStatus::Active { .. })
    }
}

/// Tracks the last use of each command by each user.
pub struct CooldownGate {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl CooldownGate {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Store key, `cooldown:{command}:{user}`.
    pub fn key(command: &str, user_id: &str) -> String {
        format!("cooldown:{}:{}", command, user_id)
    }

    /// Check whether `user_id` last used `command` less than `cooldown` ago.
    pub async fn check_cooldown(
        &self,
        command: &str,
        user_id: &str,
        cooldown: Duration,
    ) -> CooldownStatus {
        let key = Self::key(command, user_id);
        let raw = match bounded(self.operation_timeout, self.store.get(&key)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Cooldown check skipped, shared store unavailable");
                return CooldownStatus::Ready;
            }
        };

        let Some(last_use) = raw.and_then(|raw| raw.parse::<i64>().ok()) else {
            return CooldownStatus::Ready;
        };

        let elapsed = (self.clock.now_ms() - last_use).max(0) as u128;
        let cooldown_ms = cooldown.as_millis();
        if elapsed < cooldown_ms {
            let remaining = Duration::from_millis((cooldown_ms - elapsed) as u64);
            debug!(key = %key, remaining_ms = remaining.as_millis() as u64, "Command on cooldown");
            CooldownStatus::Active { remaining }
        } else {
            CooldownStatus::Ready
        }
    }

    /// Record that `user_id` used `command` now.
    pub async fn record_use(&self, command: &str, user_id: &str, cooldown: Duration) {
        let key = Self::key(command, user_id);
        let now = self.clock.now_ms().to_string();
        if let Err(e) = bounded(self.operation_timeout, self.store.set_ex(&key, now, cooldown)).await
        {
            warn!(key = %key, error = %e, "Failed to record command use");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{InMemoryStore, UnavailableStore};

    const FIVE_SECONDS: Duration = Duration::from_millis(5_000);

    fn gate(clock: Arc<ManualClock>) -> (CooldownGate, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        (CooldownGate::new(store.clone(), clock), store)
    }

    #[tokio::test]
    async fn test_ready_without_prior_use() {
        let (gate, _) = gate(Arc::new(ManualClock::new(0)));
        assert_eq!(
            gate.check_cooldown("purge", "u1", FIVE_SECONDS).await,
            CooldownStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_cooldown_remaining_and_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let (gate, store) = gate(clock.clone());

        gate.record_use("purge", "u1", FIVE_SECONDS).await;
        assert_eq!(store.raw("cooldown:purge:u1"), Some("0".to_string()));

        clock.set(2_000);
        assert_eq!(
            gate.check_cooldown("purge", "u1", FIVE_SECONDS).await,
            CooldownStatus::Active {
                remaining: Duration::from_millis(3_000)
            }
        );

        clock.set(5_001);
        assert_eq!(
            gate.check_cooldown("purge", "u1", FIVE_SECONDS).await,
            CooldownStatus::Ready
        );
        gate.record_use("purge", "u1", FIVE_SECONDS).await;
        assert_eq!(store.raw("cooldown:purge:u1"), Some("5001".to_string()));
    }

    #[tokio::test]
    async fn test_cooldowns_are_per_user_and_command() {
        let (gate, _) = gate(Arc::new(ManualClock::new(0)));
        gate.record_use("purge", "u1", FIVE_SECONDS).await;

        assert!(gate.check_cooldown("purge", "u1", FIVE_SECONDS).await.is_active());
        assert!(!gate.check_cooldown("purge", "u2", FIVE_SECONDS).await.is_active());
        assert!(!gate.check_cooldown("ping", "u1", FIVE_SECONDS).await.is_active());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let gate = CooldownGate::new(Arc::new(UnavailableStore), Arc::new(ManualClock::new(0)));
        gate.record_use("purge", "u1", FIVE_SECONDS).await;
        assert_eq!(
            gate.check_cooldown("purge", "u1", FIVE_SECONDS).await,
            CooldownStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_garbage_value_treated_as_unused() {
        let (gate, store) = gate(Arc::new(ManualClock::new(0)));
        store
            .set_ex("cooldown:purge:u1", "yesterday".to_string(), FIVE_SECONDS)
            .await
            .unwrap();
        assert_eq!(
            gate.check_cooldown("purge", "u1", FIVE_SECONDS).await,
            CooldownStatus::Ready
        );
    }
}
