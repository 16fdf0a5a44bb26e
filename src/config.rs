//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub databricks: DatabricksConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Query execution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_query_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    250
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            query_timeout_secs: default_query_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

/// Databricks SQL warehouse connection
#[derive(Debug, Clone, Deserialize)]
pub struct DatabricksConfig {
    #[serde(default)]
    pub server_hostname: String,

    /// e.g. `/sql/1.0/warehouses/<id>`
    #[serde(default)]
    pub http_path: String,

    #[serde(default)]
    pub access_token: String,

    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

fn default_wait_timeout() -> u64 {
    30
}

impl Default for DatabricksConfig {
    fn default() -> Self {
        Self {
            server_hostname: String::new(),
            http_path: String::new(),
            access_token: String::new(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

/// Analysis defaults
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Used when neither the caller nor the dashboard sets a range
    #[serde(default = "default_from")]
    pub default_from: String,

    #[serde(default = "default_to")]
    pub default_to: String,
}

fn default_from() -> String {
    "now-7d".to_string()
}

fn default_to() -> String {
    "now".to_string()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_from: default_from(),
            default_to: default_to(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        for path in Self::search_paths() {
            if path.exists() {
                match Self::load_with_env(&path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::debug!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Default config locations, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("dashql").join("config.toml")),
            Some(PathBuf::from("/etc/dashql/config.toml")),
            Some(PathBuf::from("./dashql.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a `key -> value` lookup
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Execution overrides
        if let Some(limit) = lookup("DASHQL_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.execution.concurrency_limit = limit;
        }
        if let Some(secs) = lookup("DASHQL_QUERY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.execution.query_timeout_secs = secs;
        }

        // Databricks overrides
        if let Some(host) = lookup("DATABRICKS_SERVER_HOSTNAME") {
            self.databricks.server_hostname = host;
        }
        if let Some(path) = lookup("DATABRICKS_HTTP_PATH") {
            self.databricks.http_path = path;
        }
        if let Some(token) = lookup("DATABRICKS_ACCESS_TOKEN") {
            self.databricks.access_token = token;
        }

        // Logging overrides
        if let Some(level) = lookup("DASHQL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("DASHQL_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# dashql Configuration
#
# Environment variables override these settings:
# - DASHQL_CONCURRENCY
# - DASHQL_QUERY_TIMEOUT_SECS
# - DASHQL_LOG_LEVEL
# - DASHQL_LOG_FORMAT
# - DATABRICKS_SERVER_HOSTNAME
# - DATABRICKS_HTTP_PATH
# - DATABRICKS_ACCESS_TOKEN

[execution]
# Maximum number of queries in flight at once
concurrency_limit = 4

# Per-query timeout (seconds)
query_timeout_secs = 60

# Retries for transient failures (syntax/permission errors are never retried)
max_retries = 2

# First retry delay, doubled on each further retry (ms)
retry_backoff_ms = 250

[databricks]
# Workspace host, e.g. adb-1234567890.12.azuredatabricks.net
server_hostname = ""

# SQL warehouse HTTP path
http_path = "/sql/1.0/warehouses/<warehouse-id>"

# Personal access token
access_token = ""

# Server-side wait before polling starts (5-50 seconds)
wait_timeout_secs = 30

[analysis]
# Time range used when neither the command line nor the dashboard sets one
default_from = "now-7d"
default_to = "now"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
