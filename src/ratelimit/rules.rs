//! Rate limit categories and command-to-category mapping.
//!
//! Every command belongs to exactly one category. Commands that are not
//! mapped explicitly fall into the mandatory `general` category.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GateError, Result};

/// Name of the category every unmapped command resolves to.
pub const GENERAL_CATEGORY: &str = "general";

/// Longest window a category may configure (30 days).
pub const MAX_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Limit applied to one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Length of one fixed window in milliseconds
    pub window_ms: u64,
    /// Hits admitted per window
    pub max: u32,
    /// Message shown to a caller who hit the limit
    pub message: String,
}

impl RateLimitConfig {
    pub fn new(window_ms: u64, max: u32, message: impl Into<String>) -> Self {
        Self {
            window_ms,
            max,
            message: message.into(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, category: &str) -> Result<()> {
        if self.max == 0 {
            return Err(GateError::Config(format!(
                "category '{}' must admit at least one hit per window",
                category
            )));
        }
        if self.window_ms == 0 {
            return Err(GateError::Config(format!(
                "category '{}' has an empty window",
                category
            )));
        }
        if self.window_ms > MAX_WINDOW_MS {
            return Err(GateError::Config(format!(
                "category '{}' window of {}ms exceeds the {}ms maximum",
                category, self.window_ms, MAX_WINDOW_MS
            )));
        }
        Ok(())
    }
}

/// Serialized form of [`RateLimitTable`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Category name to limit
    #[serde(default)]
    pub categories: HashMap<String, RateLimitConfig>,
    /// Command name to category name
    #[serde(default)]
    pub commands: HashMap<String, String>,
}

/// Validated category table with a guaranteed `general` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RateLimitRules", into = "RateLimitRules")]
pub struct RateLimitTable {
    general: RateLimitConfig,
    categories: HashMap<String, RateLimitConfig>,
    commands: HashMap<String, String>,
}

impl TryFrom<RateLimitRules> for RateLimitTable {
    type Error = GateError;

    fn try_from(rules: RateLimitRules) -> Result<Self> {
        for (name, config) in &rules.categories {
            config.validate(name)?;
        }

        let general = rules
            .categories
            .get(GENERAL_CATEGORY)
            .cloned()
            .ok_or_else(|| {
                GateError::Config(format!(
                    "rate limit table requires a '{}' category",
                    GENERAL_CATEGORY
                ))
            })?;

        for (command, category) in &rules.commands {
            if !rules.categories.contains_key(category) {
                return Err(GateError::Config(format!(
                    "command '{}' is mapped to unknown category '{}'",
                    command, category
                )));
            }
        }

        Ok(Self {
            general,
            categories: rules.categories,
            commands: rules.commands,
        })
    }
}

impl From<RateLimitTable> for RateLimitRules {
    fn from(table: RateLimitTable) -> Self {
        Self {
            categories: table.categories,
            commands: table.commands,
        }
    }
}

impl Default for RateLimitTable {
    fn default() -> Self {
        Self::reference()
    }
}

impl RateLimitTable {
    /// The built-in table used when no rules are configured.
    pub fn reference() -> Self {
        let categories = HashMap::from([
            (
                GENERAL_CATEGORY.to_string(),
                RateLimitConfig::new(10_000, 20, "You are using commands too quickly."),
            ),
            (
                "moderation".to_string(),
                RateLimitConfig::new(60_000, 5, "Slow down with moderation commands."),
            ),
            (
                "music".to_string(),
                RateLimitConfig::new(10_000, 10, "Slow down with music commands."),
            ),
            (
                "tickets".to_string(),
                RateLimitConfig::new(300_000, 3, "You are creating tickets too quickly."),
            ),
            (
                "profile".to_string(),
                RateLimitConfig::new(30_000, 10, "Slow down with profile commands."),
            ),
        ]);

        let commands = [
            ("ban", "moderation"),
            ("kick", "moderation"),
            ("mute", "moderation"),
            ("warn", "moderation"),
            ("purge", "moderation"),
            ("play", "music"),
            ("skip", "music"),
            ("stop", "music"),
            ("queue", "music"),
            ("ticket", "tickets"),
            ("profile", "profile"),
            ("leaderboard", "profile"),
        ]
        .into_iter()
        .map(|(command, category)| (command.to_string(), category.to_string()))
        .collect();

        Self {
            general: categories[GENERAL_CATEGORY].clone(),
            categories,
            commands,
        }
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        Self::try_from(rules)
    }

    /// Category a command belongs to.
    pub fn category_for<'a>(&'a self, command: &str) -> &'a str {
        self.commands
            .get(command)
            .map(String::as_str)
            .unwrap_or(GENERAL_CATEGORY)
    }

    /// Limit for a category, `general` when the category is unknown.
    pub fn config(&self, category: &str) -> &RateLimitConfig {
        self.categories.get(category).unwrap_or(&self.general)
    }

    /// Category name and limit for a command.
    pub fn resolve<'a>(&'a self, command: &str) -> (&'a str, &'a RateLimitConfig) {
        let category = self.category_for(command);
        (category, self.config(category))
    }

    pub fn categories(&self) -> impl Iterator<Item = (&str, &RateLimitConfig)> {
        self.categories.iter().map(|(k, v)| (k.as_str(), v))
    }
}
