//! Fixed-window entries, keys and the admission arithmetic shared by both
//! stores.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::rules::RateLimitConfig;

/// The identity granularity a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Guild,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Guild => "guild",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one rate limit window.
///
/// The bucket is a category name or a command name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub bucket: String,
    pub scope: Scope,
    pub id: String,
}

impl RateLimitKey {
    pub fn new(bucket: impl Into<String>, scope: Scope, id: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            scope,
            id: id.into(),
        }
    }

    /// Key for a per-user limit.
    pub fn user(bucket: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(bucket, Scope::User, user_id)
    }

    /// Key for a per-guild limit.
    pub fn guild(bucket: impl Into<String>, guild_id: impl Into<String>) -> Self {
        Self::new(bucket, Scope::Guild, guild_id)
    }

    /// Store key, `ratelimit:{bucket}:{scope}:{id}`.
    pub fn to_store_key(&self) -> String {
        format!("ratelimit:{}:{}:{}", self.bucket, self.scope, self.id)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// State of one fixed window for one key.
///
/// `reset_time` is fixed when the window opens and is the only authority on
/// when it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: i64,
}

impl RateLimitEntry {
    /// Open a new window at `now` holding a single hit.
    pub fn open(now_ms: i64, window: Duration) -> Self {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        Self {
            count: 1,
            reset_time: now_ms.saturating_add(window_ms),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.reset_time
    }

    /// Time left in the window, zero once expired.
    pub fn remaining(&self, now_ms: i64) -> Duration {
        Duration::from_millis((self.reset_time - now_ms).max(0) as u64)
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub limited: bool,
    pub reset_time: Option<i64>,
}

impl RateLimitDecision {
    /// Time until the window resets, measured from `now`.
    pub fn retry_after(&self, now_ms: i64) -> Duration {
        self.reset_time
            .map(|reset| Duration::from_millis((reset - now_ms).max(0) as u64))
            .unwrap_or_default()
    }
}

/// What a store must do after applying one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Admission {
    pub decision: RateLimitDecision,
    /// The entry to persist, `None` when the stored entry stays untouched.
    pub write: Option<RateLimitEntry>,
}

/// Apply one hit to the current window for a key.
///
/// A hit that brings the count to `max` is admitted; once the count has
/// reached `max` further hits are denied without incrementing.
pub(crate) fn admit(
    current: Option<RateLimitEntry>,
    now_ms: i64,
    config: &RateLimitConfig,
) -> Admission {
    match current {
        Some(entry) if !entry.is_expired(now_ms) => {
            if entry.count >= config.max {
                Admission {
                    decision: RateLimitDecision {
                        limited: true,
                        reset_time: Some(entry.reset_time),
                    },
                    write: None,
                }
            } else {
                let next = RateLimitEntry {
                    count: entry.count + 1,
                    reset_time: entry.reset_time,
                };
                Admission {
                    decision: RateLimitDecision {
                        limited: false,
                        reset_time: Some(next.reset_time),
                    },
                    write: Some(next),
                }
            }
        }
        _ => {
            let fresh = RateLimitEntry::open(now_ms, config.window());
            Admission {
                decision: RateLimitDecision {
                    limited: false,
                    reset_time: Some(fresh.reset_time),
                },
                write: Some(fresh),
            }
        }
    }
}
