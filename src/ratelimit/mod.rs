//! Rate limiting logic and state management.

mod cooldown;
mod entry;
mod fallback;
mod limiter;
mod rules;

pub use cooldown::{CooldownGate, CooldownStatus};
pub use entry::{RateLimitDecision, RateLimitEntry, RateLimitKey, Scope};
pub use fallback::FallbackStore;
pub use limiter::{RateLimiter, DEFAULT_OPERATION_TIMEOUT};
pub use rules::{RateLimitConfig, RateLimitRules, RateLimitTable, GENERAL_CATEGORY};
