//! Commands registered by the `cmdgate` binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::info;

use crate::command::{Command, CommandContext, CommandRegistry, Permission, PermissionSet, Reply, Responder};
use crate::error::Result;
use crate::ratelimit::{RateLimitKey, RateLimitTable, RateLimiter};

/// Replies "Pong!".
pub struct Ping;

#[async_trait]
impl Command for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    async fn invoke(&self, ctx: &CommandContext, responder: &dyn Responder) -> anyhow::Result<()> {
        responder.send(ctx, Reply::Text("Pong!".to_string())).await
    }
}

/// Reports how many messages a purge would remove.
pub struct Purge;

impl Purge {
    const MAX_MESSAGES: u32 = 100;
}

#[async_trait]
impl Command for Purge {
    fn name(&self) -> &str {
        "purge"
    }

    fn required_permissions(&self) -> PermissionSet {
        PermissionSet::from([Permission::ManageMessages])
    }

    fn guild_only(&self) -> bool {
        true
    }

    fn cooldown(&self) -> Option<Duration> {
        Some(Duration::from_secs(5))
    }

    async fn invoke(&self, ctx: &CommandContext, responder: &dyn Responder) -> anyhow::Result<()> {
        let raw = ctx.args.first().context("purge needs a message count")?;
        let count: u32 = raw
            .parse()
            .with_context(|| format!("'{}' is not a message count", raw))?;
        if !(1..=Self::MAX_MESSAGES).contains(&count) {
            bail!("message count {} outside 1..={}", count, Self::MAX_MESSAGES);
        }

        responder
            .send(ctx, Reply::Text(format!("Deleted {} messages.", count)))
            .await
    }
}

/// Owner-only: clears a user's window for a category.
///
/// Usage: `ratelimit-reset <user_id> <category|command>`.
pub struct RateLimitReset {
    limiter: Arc<RateLimiter>,
    rules: Arc<RateLimitTable>,
}

impl RateLimitReset {
    pub fn new(limiter: Arc<RateLimiter>, rules: Arc<RateLimitTable>) -> Self {
        Self { limiter, rules }
    }

    fn category<'a>(&'a self, name: &'a str) -> &'a str {
        if self.rules.categories().any(|(category, _)| category == name) {
            name
        } else {
            self.rules.category_for(name)
        }
    }
}

#[async_trait]
impl Command for RateLimitReset {
    fn name(&self) -> &str {
        "ratelimit-reset"
    }

    fn owner_only(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &CommandContext, responder: &dyn Responder) -> anyhow::Result<()> {
        let [user_id, target] = ctx.args.as_slice() else {
            bail!("usage: ratelimit-reset <user_id> <category|command>");
        };

        let category = self.category(target);
        self.limiter.reset(&RateLimitKey::user(category, user_id.as_str())).await;
        info!(target_user = %user_id, category = %category, "Rate limit reset by owner");

        responder
            .send(
                ctx,
                Reply::Text(format!("Reset the {} limit for {}.", category, user_id)),
            )
            .await
    }
}

/// Register every built-in command.
pub fn register_builtins(
    registry: &mut CommandRegistry,
    limiter: Arc<RateLimiter>,
    rules: Arc<RateLimitTable>,
) -> Result<()> {
    registry.register(Ping)?;
    registry.register(Purge)?;
    registry.register(RateLimitReset::new(limiter, rules))?;
    Ok(())
}
