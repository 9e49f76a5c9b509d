//! Command handlers, the context they run in and how they talk back.

mod permission;
mod registry;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::gate::Denial;

pub use permission::{Permission, PermissionSet};
pub use registry::CommandRegistry;

/// Everything known about one inbound command invocation.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Identifier used to correlate logs and replies
    pub event_id: Uuid,
    /// Name of the invoked command
    pub command: String,
    /// The invoking user
    pub user_id: String,
    /// The guild the command was invoked in, `None` in direct messages
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    /// The caller's permissions in the invoking channel
    pub permissions: PermissionSet,
    pub args: Vec<String>,
}

impl CommandContext {
    pub fn new(command: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            command: command.into(),
            user_id: user_id.into(),
            guild_id: None,
            channel_id: None,
            permissions: PermissionSet::new(),
            args: Vec::new(),
        }
    }

    pub fn in_guild(mut self, guild_id: impl Into<String>) -> Self {
        self.guild_id = Some(guild_id.into());
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// A message sent back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Output produced by a handler
    Text(String),
    /// The command was refused before it ran
    Denied(Denial),
    /// The handler failed
    Failed,
}

impl Reply {
    pub const FAILURE_NOTICE: &'static str = "There was an error while executing this command.";

    /// Text shown to the caller.
    pub fn content(&self) -> String {
        match self {
            Reply::Text(text) => text.clone(),
            Reply::Denied(denial) => denial.to_string(),
            Reply::Failed => Self::FAILURE_NOTICE.to_string(),
        }
    }
}

/// Delivers replies to whoever invoked a command.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn send(&self, ctx: &CommandContext, reply: Reply) -> anyhow::Result<()>;
}

/// A command handler together with its admission requirements.
#[async_trait]
pub trait Command: Send + Sync {
    /// Name the command is invoked by.
    fn name(&self) -> &str;

    /// Permissions the caller must hold.
    fn required_permissions(&self) -> PermissionSet {
        PermissionSet::new()
    }

    /// Whether the command needs a guild context.
    fn guild_only(&self) -> bool {
        false
    }

    /// Whether only configured owners may run the command.
    fn owner_only(&self) -> bool {
        false
    }

    /// Minimum spacing between uses by one user.
    fn cooldown(&self) -> Option<Duration> {
        None
    }

    /// Run the command.
    async fn invoke(&self, ctx: &CommandContext, responder: &dyn Responder) -> anyhow::Result<()>;
}
