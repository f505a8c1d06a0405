//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/chunkwarden/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/chunkwarden/` (~/.config/chunkwarden/)
//! - Data: `$XDG_DATA_HOME/chunkwarden/` (~/.local/share/chunkwarden/)
//! - State/Logs: `$XDG_STATE_HOME/chunkwarden/` (~/.local/state/chunkwarden/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Store location
    #[serde(default)]
    pub store: StoreConfig,

    /// Alias, orphan, migration and cleanup tuning
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Resilience store location
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StoreConfig {
    /// Database file; defaults to [`Config::database_path`]
    pub path: Option<PathBuf>,
}

/// Tuning for the resilience subsystem
#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    /// Maximum number of prior paths kept per alias
    #[serde(default = "default_max_version_history")]
    pub max_version_history: usize,

    /// Aliases untouched for this many days are expired
    #[serde(default = "default_alias_expiration_days")]
    pub alias_expiration_days: u32,

    /// Seconds between background orphan detection passes
    #[serde(default = "default_orphan_detection_interval")]
    pub orphan_detection_interval_seconds: u64,

    /// Minimum cleanup priority for an orphan to be reclaimed
    #[serde(
        default = "default_orphan_priority_threshold",
        alias = "orphan_cleanup_threshold"
    )]
    pub orphan_priority_threshold: f64,

    /// Chunks per group for batch and intelligent migrations
    #[serde(default = "default_migration_batch_size")]
    pub migration_batch_size: usize,

    /// A migration running longer than this fails
    #[serde(default = "default_migration_timeout")]
    pub migration_timeout_seconds: u64,

    /// Pause between groups for gradual and intelligent migrations
    #[serde(default)]
    pub migration_step_delay_ms: u64,

    /// Roll back failed migrations from the background consumer
    #[serde(default)]
    pub auto_rollback_on_failure: bool,

    /// Seconds between background cleanup passes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    /// Upper bound on reclamations per background cleanup pass
    #[serde(default = "default_max_cleanup_operations")]
    pub max_cleanup_operations: usize,

    /// Upper bound on reclamations during an on-demand resilience check
    #[serde(default = "default_check_cleanup_limit")]
    pub check_cleanup_limit: usize,

    /// Reclaim on priority alone, ignoring the age/size rule
    #[serde(default)]
    pub enable_aggressive_cleanup: bool,

    /// Sleep after a failed worker tick
    #[serde(default = "default_worker_backoff")]
    pub worker_backoff_seconds: u64,

    /// How long `stop()` waits for each worker
    #[serde(default = "default_worker_join_timeout")]
    pub worker_join_timeout_seconds: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_version_history: default_max_version_history(),
            alias_expiration_days: default_alias_expiration_days(),
            orphan_detection_interval_seconds: default_orphan_detection_interval(),
            orphan_priority_threshold: default_orphan_priority_threshold(),
            migration_batch_size: default_migration_batch_size(),
            migration_timeout_seconds: default_migration_timeout(),
            migration_step_delay_ms: 0,
            auto_rollback_on_failure: false,
            cleanup_interval_seconds: default_cleanup_interval(),
            max_cleanup_operations: default_max_cleanup_operations(),
            check_cleanup_limit: default_check_cleanup_limit(),
            enable_aggressive_cleanup: false,
            worker_backoff_seconds: default_worker_backoff(),
            worker_join_timeout_seconds: default_worker_join_timeout(),
        }
    }
}

impl ResilienceConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.orphan_priority_threshold) {
            return Err(Error::Config(
                "resilience.orphan_priority_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.max_version_history == 0 {
            return Err(Error::Config(
                "resilience.max_version_history must be at least 1".to_string(),
            ));
        }
        if self.migration_batch_size == 0 {
            return Err(Error::Config(
                "resilience.migration_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_cleanup_operations == 0 {
            return Err(Error::Config(
                "resilience.max_cleanup_operations must be at least 1".to_string(),
            ));
        }
        if self.orphan_detection_interval_seconds == 0 || self.cleanup_interval_seconds == 0 {
            return Err(Error::Config(
                "resilience worker intervals must be greater than zero".to_string(),
            ));
        }
        if self.migration_timeout_seconds == 0 {
            return Err(Error::Config(
                "resilience.migration_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_detection_interval_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_seconds)
    }

    pub fn migration_step_delay(&self) -> Duration {
        Duration::from_millis(self.migration_step_delay_ms)
    }

    pub fn worker_backoff(&self) -> Duration {
        Duration::from_secs(self.worker_backoff_seconds)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_join_timeout_seconds)
    }
}

fn default_max_version_history() -> usize {
    10
}

fn default_alias_expiration_days() -> u32 {
    365
}

fn default_orphan_detection_interval() -> u64 {
    3600
}

fn default_orphan_priority_threshold() -> f64 {
    0.5
}

fn default_migration_batch_size() -> usize {
    50
}

fn default_migration_timeout() -> u64 {
    300
}

fn default_cleanup_interval() -> u64 {
    7200
}

fn default_max_cleanup_operations() -> usize {
    100
}

fn default_check_cleanup_limit() -> usize {
    50
}

fn default_worker_backoff() -> u64 {
    60
}

fn default_worker_join_timeout() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.resilience.validate()?;
        Ok(config)
    }

    /// Store path from config, or the XDG default
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(Self::database_path)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/chunkwarden/config.toml` (~/.config/chunkwarden/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("chunkwarden").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/chunkwarden/` (~/.local/share/chunkwarden/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("chunkwarden")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/chunkwarden/` (~/.local/state/chunkwarden/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("chunkwarden")
    }

    /// Returns the default database file path
    ///
    /// `$XDG_DATA_HOME/chunkwarden/resilience.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("resilience.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/chunkwarden/chunkwarden.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("chunkwarden.log")
    }
}
