//! Configuration loader and validator for the ingestion pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

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
    pub telegram: Telegram,
    pub legacy: Legacy,
}

/// App-level settings shared by both entry points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Posts per write transaction.
    pub batch_size: usize,
    /// Pause between source requests, the adapter's rate limit.
    pub request_pause_ms: u64,
    pub max_retries: u32,
    /// Total elapsed time allowed across retries of one request.
    pub retry_budget_seconds: u64,
}

/// Telegram channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub channel: String,
    pub base_url: String,
}

/// Legacy CMS dump settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Legacy {
    pub sql_file: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
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
    if cfg.app.batch_size == 0 {
        return Err(ConfigError::Invalid("app.batch_size must be > 0"));
    }
    if cfg.app.max_retries == 0 {
        return Err(ConfigError::Invalid("app.max_retries must be > 0"));
    }
    if cfg.app.retry_budget_seconds == 0 {
        return Err(ConfigError::Invalid(
            "app.retry_budget_seconds must be > 0",
        ));
    }

    if cfg.telegram.channel.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.channel must be non-empty"));
    }
    if cfg.telegram.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.base_url must be non-empty"));
    }

    if cfg.legacy.sql_file.trim().is_empty() {
        return Err(ConfigError::Invalid("legacy.sql_file must be non-empty"));
    }

    Ok(())
}

/// Example YAML configuration, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  batch_size: 20
  request_pause_ms: 400
  max_retries: 3
  retry_budget_seconds: 60

telegram:
  channel: "akibaautovl"
  base_url: "https://t.me"

legacy:
  sql_file: "akiba_base.sql"
"#
}
