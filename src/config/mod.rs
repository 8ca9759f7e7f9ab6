//! Configuration management for claimfleet
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Every section has defaults, so a file only needs
//! the values it changes.
//!
//! ```toml
//! [scheduler]
//! max_concurrent = 4
//!
//! [breaker]
//! failure_threshold = 5
//!
//! [storage]
//! session_path = "/var/lib/claimfleet/session_state.json"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::proxy::ProxyConfig;
use crate::resilience::{CircuitBreakerConfig, RecoveryConfig};
use crate::scheduler::SchedulerConfig;
use crate::storage::StorageConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CLAIMFLEET_";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduling loop configuration
    pub scheduler: SchedulerConfig,

    /// Circuit breaker configuration
    pub breaker: CircuitBreakerConfig,

    /// Recovery delays and retry budget
    pub recovery: RecoveryConfig,

    /// Proxy health tracking
    pub proxy: ProxyConfig,

    /// Persisted state locations
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {ENV_PREFIX}{name}={raw}: {e}")),
        None => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Override values from `CLAIMFLEET_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse("MAX_CONCURRENT")? {
            self.scheduler.max_concurrent = v;
        }
        if let Some(v) = env_parse("MAX_PER_ACCOUNT")? {
            self.scheduler.max_per_account = v;
        }
        if let Some(v) = env_parse("MIN_GAP_SECS")? {
            self.scheduler.min_gap_secs = v;
        }
        if let Some(v) = env_parse("SHUTDOWN_GRACE_SECS")? {
            self.scheduler.shutdown_grace_secs = v;
        }
        if let Some(v) = env_parse("FAILURE_THRESHOLD")? {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = env_parse("COOLDOWN_SECS")? {
            self.breaker.cooldown_secs = v;
        }
        if let Some(v) = env_parse("MAX_RETRIES")? {
            self.recovery.max_retries = v;
        }
        if let Some(v) = env_parse("PROXY_MAX_FAILURES")? {
            self.proxy.max_failures = v;
        }
        if let Some(v) = env_var("SESSION_PATH") {
            self.storage.session_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse("BACKUP_COUNT")? {
            self.storage.backup_count = v;
        }
        if let Some(v) = env_var("HEARTBEAT_PATH") {
            self.storage.heartbeat_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env_var("LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.scheduler
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be greater than 0");
        }
        if self.breaker.cooldown_secs <= 0 {
            anyhow::bail!("breaker.cooldown_secs must be positive");
        }
        if self.breaker.history_capacity < self.breaker.proxy_issue_min_occurrences {
            anyhow::bail!("breaker.history_capacity must hold proxy_issue_min_occurrences entries");
        }

        if self.recovery.rate_limited_backoff_secs.is_empty() {
            anyhow::bail!("recovery.rate_limited_backoff_secs must not be empty");
        }
        if self.recovery.jitter_min_secs < 0 || self.recovery.jitter_min_secs > self.recovery.jitter_max_secs {
            anyhow::bail!("recovery jitter bounds must satisfy 0 <= min <= max");
        }

        if self.proxy.max_failures == 0 {
            anyhow::bail!("proxy.max_failures must be greater than 0");
        }

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            anyhow::bail!(
                "logging.level must be one of trace, debug, info, warn, error, got '{}'",
                self.logging.level
            );
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json', got '{}'", self.logging.format);
        }

        Ok(())
    }
}
