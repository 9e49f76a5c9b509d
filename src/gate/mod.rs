//! The admission pipeline run for every inbound command.
//!
//! Checks run in a fixed order and stop at the first denial:
//! lookup, guild-only, owner-only, permissions, category rate limit,
//! cooldown. Only then is the handler invoked, and whatever it does
//! (error or panic) is contained here.

mod denial;

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::command::{Command, CommandContext, CommandRegistry, Reply, Responder};
use crate::ratelimit::{CooldownGate, CooldownStatus, RateLimitKey, RateLimitTable, RateLimiter};

pub use denial::Denial;

/// Terminal state of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No such command; nothing was sent to the caller
    Dropped,
    /// Refused before the handler ran
    Denied(Denial),
    /// The handler ran and returned successfully
    Completed,
    /// The handler returned an error or panicked
    Failed,
}

/// Orders admission checks in front of command handlers.
pub struct AdmissionGate {
    registry: Arc<CommandRegistry>,
    limiter: Arc<RateLimiter>,
    cooldowns: Arc<CooldownGate>,
    rules: Arc<RateLimitTable>,
    owners: HashSet<String>,
}

impl AdmissionGate {
    pub fn new(
        registry: Arc<CommandRegistry>,
        limiter: Arc<RateLimiter>,
        cooldowns: Arc<CooldownGate>,
        rules: Arc<RateLimitTable>,
    ) -> Self {
        Self {
            registry,
            limiter,
            cooldowns,
            rules,
            owners: HashSet::new(),
        }
    }

    /// Users allowed to run owner-only commands.
    pub fn with_owners<I, S>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owners = owners.into_iter().map(Into::into).collect();
        self
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn rules(&self) -> &Arc<RateLimitTable> {
        &self.rules
    }

    /// Run the admission checks for `command` and, if they pass, record the
    /// use against its cooldown.
    pub async fn admit(&self, ctx: &CommandContext, command: &dyn Command) -> Result<(), Denial> {
        if command.guild_only() && ctx.guild_id.is_none() {
            return Err(Denial::GuildOnly);
        }

        if command.owner_only() && !self.owners.contains(&ctx.user_id) {
            return Err(Denial::OwnerOnly);
        }

        if let Some(missing) = ctx.permissions.first_missing(&command.required_permissions()) {
            return Err(Denial::MissingPermission(missing));
        }

        let (category, config) = self.rules.resolve(command.name());
        let key = RateLimitKey::user(category, ctx.user_id.as_str());
        let decision = self.limiter.check(&key, config).await;
        if decision.limited {
            let now = self.limiter.clock().now_ms();
            return Err(Denial::RateLimited {
                message: config.message.clone(),
                retry_after: decision.retry_after(now),
            });
        }

        if let Some(cooldown) = command.cooldown() {
            let name = command.name();
            match self.cooldowns.check_cooldown(name, &ctx.user_id, cooldown).await {
                CooldownStatus::Active { remaining } => {
                    return Err(Denial::Cooldown { remaining });
                }
                CooldownStatus::Ready => {
                    self.cooldowns.record_use(name, &ctx.user_id, cooldown).await;
                }
            }
        }

        Ok(())
    }

    /// Handle one inbound command from lookup to completion.
    #[instrument(
        skip_all,
        fields(
            event_id = %ctx.event_id,
            command = %ctx.command,
            user_id = %ctx.user_id,
            guild_id = ?ctx.guild_id
        )
    )]
    pub async fn dispatch(&self, ctx: &CommandContext, responder: &dyn Responder) -> DispatchOutcome {
        let Some(command) = self.registry.lookup(&ctx.command) else {
            info!("Unknown command, dropping event");
            return DispatchOutcome::Dropped;
        };

        if let Err(denial) = self.admit(ctx, command.as_ref()).await {
            info!(reason = denial.kind(), "Command denied");
            let outcome = DispatchOutcome::Denied(denial.clone());
            deliver(responder, ctx, Reply::Denied(denial)).await;
            return outcome;
        }

        debug!("Command admitted, invoking handler");

        let result = AssertUnwindSafe(command.invoke(ctx, responder))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                debug!("Command completed");
                DispatchOutcome::Completed
            }
            Ok(Err(e)) => {
                error!(error = ?e, "Command handler failed");
                deliver(responder, ctx, Reply::Failed).await;
                DispatchOutcome::Failed
            }
            Err(panic) => {
                error!(panic = %panic_message(panic.as_ref()), "Command handler panicked");
                deliver(responder, ctx, Reply::Failed).await;
                DispatchOutcome::Failed
            }
        }
    }
}

async fn deliver(responder: &dyn Responder, ctx: &CommandContext, reply: Reply) {
    if let Err(e) = responder.send(ctx, reply).await {
        warn!(error = %e, "Failed to deliver reply");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::command::{Permission, PermissionSet};
    use crate::ratelimit::{RateLimitConfig, GENERAL_CATEGORY};
    use crate::store::{InMemoryStore, SharedStore, UnavailableStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct TestCommand {
        name: &'static str,
        permissions: PermissionSet,
        guild_only: bool,
        owner_only: bool,
        cooldown: Option<Duration>,
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
    }

    impl TestCommand {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                permissions: PermissionSet::new(),
                guild_only: false,
                owner_only: false,
                cooldown: None,
                behavior: Behavior::Succeed,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Command for TestCommand {
        fn name(&self) -> &str {
            self.name
        }

        fn required_permissions(&self) -> PermissionSet {
            self.permissions.clone()
        }

        fn guild_only(&self) -> bool {
            self.guild_only
        }

        fn owner_only(&self) -> bool {
            self.owner_only
        }

        fn cooldown(&self) -> Option<Duration> {
            self.cooldown
        }

        async fn invoke(&self, ctx: &CommandContext, responder: &dyn Responder) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => responder.send(ctx, Reply::Text("done".to_string())).await,
                Behavior::Fail => Err(anyhow::anyhow!("database is on fire")),
                Behavior::Panic => panic!("handler exploded"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingResponder {
        replies: Mutex<Vec<Reply>>,
    }

    impl RecordingResponder {
        fn replies(&self) -> Vec<Reply> {
            self.replies.lock().clone()
        }
    }

    #[async_trait]
    impl Responder for RecordingResponder {
        async fn send(&self, _ctx: &CommandContext, reply: Reply) -> anyhow::Result<()> {
            self.replies.lock().push(reply);
            Ok(())
        }
    }

    struct BrokenResponder;

    #[async_trait]
    impl Responder for BrokenResponder {
        async fn send(&self, _ctx: &CommandContext, _reply: Reply) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("channel deleted"))
        }
    }

    struct Harness {
        gate: AdmissionGate,
        clock: Arc<ManualClock>,
        responder: RecordingResponder,
    }

    fn harness_with(
        commands: Vec<TestCommand>,
        store: Option<Arc<dyn SharedStore>>,
        rules: RateLimitTable,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let store =
            store.unwrap_or_else(|| Arc::new(InMemoryStore::new(clock.clone())) as Arc<dyn SharedStore>);

        let mut registry = CommandRegistry::new();
        for command in commands {
            registry.register(command).unwrap();
        }

        let limiter = Arc::new(RateLimiter::new(store.clone(), clock.clone()));
        let cooldowns = Arc::new(CooldownGate::new(store, clock.clone()));
        let gate = AdmissionGate::new(Arc::new(registry), limiter, cooldowns, Arc::new(rules))
            .with_owners(["owner"]);

        Harness {
            gate,
            clock,
            responder: RecordingResponder::default(),
        }
    }

    fn harness(commands: Vec<TestCommand>) -> Harness {
        harness_with(commands, None, RateLimitTable::reference())
    }

    #[tokio::test]
    async fn test_unknown_command_is_dropped_silently() {
        let h = harness(vec![]);
        let ctx = CommandContext::new("nope", "u1");

        assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Dropped);
        assert!(h.responder.replies().is_empty());
    }

    #[tokio::test]
    async fn test_successful_dispatch() {
        let command = TestCommand::new("ping");
        let calls = command.calls.clone();
        let h = harness(vec![command]);

        let outcome = h.gate.dispatch(&CommandContext::new("ping", "u1"), &h.responder).await;

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.responder.replies(), vec![Reply::Text("done".to_string())]);
    }

    #[tokio::test]
    async fn test_guild_only_checked_before_permissions() {
        let mut command = TestCommand::new("purge");
        command.guild_only = true;
        command.permissions = PermissionSet::from([Permission::ManageMessages]);
        let calls = command.calls.clone();
        let h = harness(vec![command]);

        let outcome = h.gate.dispatch(&CommandContext::new("purge", "u1"), &h.responder).await;

        assert_eq!(outcome, DispatchOutcome::Denied(Denial::GuildOnly));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.responder.replies(), vec![Reply::Denied(Denial::GuildOnly)]);
    }

    #[tokio::test]
    async fn test_owner_only() {
        let mut command = TestCommand::new("shutdown");
        command.owner_only = true;
        let h = harness(vec![command]);

        let denied = h.gate.dispatch(&CommandContext::new("shutdown", "u1"), &h.responder).await;
        assert_eq!(denied, DispatchOutcome::Denied(Denial::OwnerOnly));

        let allowed = h.gate.dispatch(&CommandContext::new("shutdown", "owner"), &h.responder).await;
        assert_eq!(allowed, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_first_missing_permission_is_named() {
        let mut command = TestCommand::new("ban");
        command.permissions = PermissionSet::from([Permission::KickMembers, Permission::BanMembers]);
        let h = harness(vec![command]);

        let ctx = CommandContext::new("ban", "u1")
            .in_guild("g1")
            .with_permissions(PermissionSet::from([Permission::KickMembers]));
        let outcome = h.gate.dispatch(&ctx, &h.responder).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Denied(Denial::MissingPermission(Permission::BanMembers))
        );
    }

    #[tokio::test]
    async fn test_denials_before_rate_limit_do_not_count() {
        let mut command = TestCommand::new("ban");
        command.permissions = PermissionSet::from([Permission::BanMembers]);
        let h = harness(vec![command]);

        let ctx = CommandContext::new("ban", "u1").in_guild("g1");
        h.gate.dispatch(&ctx, &h.responder).await;

        let key = RateLimitKey::user("moderation", "u1");
        assert_eq!(h.gate.limiter().peek(&key).await, None);
    }

    #[tokio::test]
    async fn test_category_rate_limit() {
        let h = harness(vec![TestCommand::new("kick")]);
        let ctx = CommandContext::new("kick", "u1").in_guild("g1");

        for _ in 0..5 {
            assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Completed);
        }

        h.clock.set(1_000);
        match h.gate.dispatch(&ctx, &h.responder).await {
            DispatchOutcome::Denied(Denial::RateLimited {
                message,
                retry_after,
            }) => {
                assert_eq!(message, "Slow down with moderation commands.");
                assert_eq!(retry_after, Duration::from_millis(59_000));
            }
            other => panic!("expected rate limit denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmapped_command_uses_general_limit() {
        let command = TestCommand::new("hello");
        let calls = command.calls.clone();
        let h = harness(vec![command]);
        let ctx = CommandContext::new("hello", "u1");

        for _ in 0..20 {
            assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Completed);
        }
        let outcome = h.gate.dispatch(&ctx, &h.responder).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Denied(Denial::RateLimited { ref message, .. })
                if message == "You are using commands too quickly."
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 20);

        let key = RateLimitKey::user(GENERAL_CATEGORY, "u1");
        let entry = h.gate.limiter().peek(&key).await.unwrap();
        assert_eq!(entry.count, 20);
        assert_eq!(entry.reset_time, 10_000);
    }

    #[tokio::test]
    async fn test_commands_in_one_category_share_a_limit() {
        let rules = RateLimitTable::from_yaml(
            r#"
categories:
  general:
    window_ms: 10000
    max: 20
    message: "slow"
  music:
    window_ms: 10000
    max: 2
    message: "too much music"
commands:
  play: music
  skip: music
"#,
        )
        .unwrap();
        let h = harness_with(
            vec![TestCommand::new("play"), TestCommand::new("skip")],
            None,
            rules,
        );

        let play = CommandContext::new("play", "u1");
        let skip = CommandContext::new("skip", "u1");
        assert_eq!(h.gate.dispatch(&play, &h.responder).await, DispatchOutcome::Completed);
        assert_eq!(h.gate.dispatch(&skip, &h.responder).await, DispatchOutcome::Completed);
        assert!(matches!(
            h.gate.dispatch(&play, &h.responder).await,
            DispatchOutcome::Denied(Denial::RateLimited { .. })
        ));

        let other_user = CommandContext::new("skip", "u2");
        assert_eq!(h.gate.dispatch(&other_user, &h.responder).await, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_cooldown_scenario() {
        let mut command = TestCommand::new("daily");
        command.cooldown = Some(Duration::from_millis(5_000));
        let calls = command.calls.clone();
        let h = harness(vec![command]);
        let ctx = CommandContext::new("daily", "u1");

        assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Completed);

        h.clock.set(2_000);
        assert_eq!(
            h.gate.dispatch(&ctx, &h.responder).await,
            DispatchOutcome::Denied(Denial::Cooldown {
                remaining: Duration::from_millis(3_000)
            })
        );

        // The denial above must not have restarted the cooldown.
        h.clock.set(5_001);
        assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        h.clock.set(6_000);
        assert!(matches!(
            h.gate.dispatch(&ctx, &h.responder).await,
            DispatchOutcome::Denied(Denial::Cooldown { .. })
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_denial_does_not_record_cooldown() {
        let rules = RateLimitTable::from_yaml(
            r#"
categories:
  general:
    window_ms: 1000
    max: 1
    message: "slow"
"#,
        )
        .unwrap();
        let mut command = TestCommand::new("daily");
        command.cooldown = Some(Duration::from_millis(500));
        let h = harness_with(vec![command], None, rules);
        let ctx = CommandContext::new("daily", "u1");

        assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Completed);

        h.clock.set(600);
        assert!(matches!(
            h.gate.dispatch(&ctx, &h.responder).await,
            DispatchOutcome::Denied(Denial::RateLimited { .. })
        ));

        h.clock.set(1_000);
        assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let mut command = TestCommand::new("broken");
        command.behavior = Behavior::Fail;
        let h = harness(vec![command]);

        let outcome = h.gate.dispatch(&CommandContext::new("broken", "u1"), &h.responder).await;

        assert_eq!(outcome, DispatchOutcome::Failed);
        assert_eq!(h.responder.replies(), vec![Reply::Failed]);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let mut command = TestCommand::new("explode");
        command.behavior = Behavior::Panic;
        let h = harness(vec![command, TestCommand::new("ping")]);

        let outcome = h.gate.dispatch(&CommandContext::new("explode", "u1"), &h.responder).await;
        assert_eq!(outcome, DispatchOutcome::Failed);
        assert_eq!(h.responder.replies(), vec![Reply::Failed]);

        let next = h.gate.dispatch(&CommandContext::new("ping", "u1"), &h.responder).await;
        assert_eq!(next, DispatchOutcome::Completed);
    }

    #[tokio::test]
    async fn test_undeliverable_reply_keeps_outcome() {
        let mut command = TestCommand::new("purge");
        command.guild_only = true;
        let h = harness(vec![command]);

        let outcome = h
            .gate
            .dispatch(&CommandContext::new("purge", "u1"), &BrokenResponder)
            .await;
        assert_eq!(outcome, DispatchOutcome::Denied(Denial::GuildOnly));
    }

    #[tokio::test]
    async fn test_gate_works_without_shared_store() {
        let rules = RateLimitTable::from_yaml(
            r#"
categories:
  general:
    window_ms: 1000
    max: 3
    message: "slow"
"#,
        )
        .unwrap();
        let mut command = TestCommand::new("daily");
        command.cooldown = Some(Duration::from_secs(60));
        let h = harness_with(vec![command], Some(Arc::new(UnavailableStore)), rules);
        let ctx = CommandContext::new("daily", "u1");

        // Cooldowns fail open while limits still hold locally.
        for _ in 0..3 {
            assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Completed);
        }
        h.clock.set(10);
        match h.gate.dispatch(&ctx, &h.responder).await {
            DispatchOutcome::Denied(Denial::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_millis(990));
            }
            other => panic!("expected rate limit denial, got {:?}", other),
        }

        h.clock.set(1_100);
        assert_eq!(h.gate.dispatch(&ctx, &h.responder).await, DispatchOutcome::Completed);
        assert_eq!(h.gate.limiter().fallback().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_admit_with_custom_limit() {
        let rules = RateLimitTable::from_yaml(
            r#"
categories:
  general:
    window_ms: 1000
    max: 1
    message: "slow"
"#,
        )
        .unwrap();
        let h = harness_with(vec![TestCommand::new("ping")], None, rules);
        let command = h.gate.registry().lookup("ping").unwrap();
        let ctx = CommandContext::new("ping", "u1");

        assert!(h.gate.admit(&ctx, command.as_ref()).await.is_ok());
        assert!(h.gate.admit(&ctx, command.as_ref()).await.is_err());
        assert_eq!(
            h.gate.rules().config(GENERAL_CATEGORY),
            &RateLimitConfig::new(1000, 1, "slow")
        );
    }
}
