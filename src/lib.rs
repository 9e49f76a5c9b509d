//! cmdgate - Admission Control for Bot Commands
//!
//! This crate gates remotely-triggered commands behind permission checks,
//! fixed-window rate limits and per-command cooldowns before handing control
//! to handler logic. Limiter state is shared between instances through an
//! external key-value store and degrades to per-instance state when that
//! store is unavailable.

pub mod builtin;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod gate;
pub mod ingress;
pub mod ratelimit;
pub mod store;
