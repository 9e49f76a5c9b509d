//! Caller-visible reasons for refusing a command.

use std::fmt;
use std::time::Duration;

use crate::command::Permission;

/// Why a command was refused before its handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// Invoked outside a guild
    GuildOnly,
    /// Invoked by someone who is not an owner
    OwnerOnly,
    /// The caller lacks a required permission
    MissingPermission(Permission),
    /// The command's category limit is exhausted
    RateLimited { message: String, retry_after: Duration },
    /// The caller used this command too recently
    Cooldown { remaining: Duration },
}

impl Denial {
    /// Short machine-readable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Denial::GuildOnly => "guild_only",
            Denial::OwnerOnly => "owner_only",
            Denial::MissingPermission(_) => "missing_permission",
            Denial::RateLimited { .. } => "rate_limited",
            Denial::Cooldown { .. } => "cooldown",
        }
    }
}

/// Whole seconds, rounded up so a countdown never shows zero early.
pub(crate) fn whole_seconds(duration: Duration) -> u64 {
    duration.as_millis().div_ceil(1000) as u64
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::GuildOnly => f.write_str("This command can only be used in a server."),
            Denial::OwnerOnly => f.write_str("This command is restricted to the bot owners."),
            Denial::MissingPermission(permission) => write!(
                f,
                "You need the {} permission to use this command.",
                permission
            ),
            Denial::RateLimited {
                message,
                retry_after,
            } => write!(f, "{} Try again in {}s.", message, whole_seconds(*retry_after)),
            Denial::Cooldown { remaining } => write!(
                f,
                "Please wait {}s before using this command again.",
                whole_seconds(*remaining)
            ),
        }
    }
}
