//! Configuration loader and validator for the depot sync engine.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
    pub distribution: Distribution,
    pub audit: Audit,
}

/// Device-side settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How often the connectivity probe pings the remote store.
    pub probe_interval_ms: u64,
    /// Upper bound for a single direct write before it counts as failed.
    pub write_timeout_ms: u64,
}

/// Remote inventory store endpoint and provider limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub token: String,
    /// Maximum keys accepted by one key-in-set lookup.
    pub lookup_limit: usize,
    /// Maximum writes accepted by one atomic batch.
    pub batch_limit: usize,
    pub request_timeout_ms: u64,
}

/// Conflict retry policy for distribution transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Distribution {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Audit {
    /// Actors allowed to bulk-delete the activity log.
    pub admins: Vec<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL for the pending record store, honoring `DATABASE_URL`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/pending.db", self.app.data_dir))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.app.write_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.app.probe_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.distribution.max_attempts,
            base_backoff_ms: self.distribution.base_backoff_ms,
            max_backoff_ms: self.distribution.max_backoff_ms,
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.probe_interval_ms must be > 0"));
    }
    if cfg.app.write_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.write_timeout_ms must be > 0"));
    }

    if cfg.remote.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if cfg.remote.token.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.token must be non-empty"));
    }
    if cfg.remote.lookup_limit == 0 {
        return Err(ConfigError::Invalid("remote.lookup_limit must be > 0"));
    }
    // Distribution needs room for the bucket write and the activity entry.
    if cfg.remote.batch_limit < 3 {
        return Err(ConfigError::Invalid("remote.batch_limit must be >= 3"));
    }
    if cfg.remote.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("remote.request_timeout_ms must be > 0"));
    }

    if cfg.distribution.max_attempts == 0 {
        return Err(ConfigError::Invalid("distribution.max_attempts must be > 0"));
    }
    if cfg.distribution.max_backoff_ms < cfg.distribution.base_backoff_ms {
        return Err(ConfigError::Invalid(
            "distribution.max_backoff_ms must be >= distribution.base_backoff_ms",
        ));
    }

    if cfg.audit.admins.iter().any(|a| a.trim().is_empty()) {
        return Err(ConfigError::Invalid("audit.admins entries must be non-empty"));
    }

    Ok(())
}

/// Reference configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  probe_interval_ms: 5000
  write_timeout_ms: 10000

remote:
  base_url: "https://inventory.example.com/"
  token: "YOUR_API_TOKEN"
  lookup_limit: 30
  batch_limit: 500
  request_timeout_ms: 15000

distribution:
  max_attempts: 5
  base_backoff_ms: 50
  max_backoff_ms: 2000

audit:
  admins:
    - "supervisor@depot.example"
"#
}
