//! Configuration management for cmdgate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::ratelimit::{RateLimitRules, RateLimitTable, DEFAULT_OPERATION_TIMEOUT};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "CMDGATE";

/// Main configuration for the cmdgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Users allowed to run owner-only commands
    #[serde(default)]
    pub owners: Vec<String>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; without one every instance limits on its own
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Bound on a single store operation in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            operation_timeout_ms: default_operation_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_operation_timeout() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_millis() as u64
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// How often expired fallback windows are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Path to a YAML rules file; takes precedence over inline rules
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Inline rules; the reference table is used when absent
    #[serde(default)]
    pub rules: Option<RateLimitRules>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            rules_path: None,
            rules: None,
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Build the validated category table.
    pub fn table(&self) -> Result<RateLimitTable> {
        if let Some(path) = &self.rules_path {
            return RateLimitTable::from_file(path);
        }
        match &self.rules {
            Some(rules) => RateLimitTable::try_from(rules.clone()),
            None => Ok(RateLimitTable::reference()),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateConfig {
    /// Load configuration from an optional YAML file layered under
    /// `CMDGATE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(std::path::Path::new(path))
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: GateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.operation_timeout_ms == 0 {
            return Err(GateError::Config(
                "store.operation_timeout_ms must be positive".to_string(),
            ));
        }
        // Surfaces rule errors at startup rather than on first use.
        if self.rate_limiting.rules_path.is_none() {
            self.rate_limiting.table()?;
        }
        Ok(())
    }
}
