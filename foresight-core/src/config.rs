//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/foresight/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/foresight/` (~/.config/foresight/)
//! - Data: `$XDG_DATA_HOME/foresight/` (~/.local/share/foresight/)
//! - State/Logs: `$XDG_STATE_HOME/foresight/` (~/.local/state/foresight/)

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

/// XDG base directories as `(variable, fallback under $HOME)`
const XDG_DIRS: [(&str, &str); 3] = [
    ("XDG_CONFIG_HOME", ".config"),
    ("XDG_DATA_HOME", ".local/share"),
    ("XDG_STATE_HOME", ".local/state"),
];

fn xdg_dir(var: &str) -> PathBuf {
    if let Some(dir) = std::env::var_os(var).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    let fallback = XDG_DIRS
        .iter()
        .find(|(name, _)| *name == var)
        .map_or(".", |(_, rel)| *rel);
    home_dir().join(fallback)
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// In-memory buffer bounds
    #[serde(default)]
    pub buffers: BufferConfig,

    /// Durable store retry and retention policy
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Feature vector layout
    #[serde(default)]
    pub features: FeatureConfig,

    /// Model training policy
    #[serde(default)]
    pub models: ModelConfig,

    /// Retraining scheduler policy
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bounds of the in-memory event buffers
#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    /// Maximum buffered user actions
    #[serde(default = "default_action_capacity")]
    pub action_capacity: usize,

    /// Maximum buffered system metrics
    #[serde(default = "default_metric_capacity")]
    pub metric_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            action_capacity: default_action_capacity(),
            metric_capacity: default_metric_capacity(),
        }
    }
}

fn default_action_capacity() -> usize {
    50
}

fn default_metric_capacity() -> usize {
    100
}

/// Retry and retention policy for the durable store
#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// Attempts per append before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles afterwards
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling for the backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Default retention horizon for `trim`, at most [`MAX_RETENTION_DAYS`]
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retention_days: default_retention_days(),
        }
    }
}

impl PersistenceConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    25
}

fn default_max_delay_ms() -> u64 {
    1000
}

fn default_retention_days() -> u32 {
    90
}

/// Longest retention horizon accepted anywhere (100 years)
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Feature vector layout
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct FeatureConfig {
    /// Hash buckets for action categories
    #[serde(default = "default_category_buckets")]
    pub category_buckets: usize,

    /// Hash buckets for application names
    #[serde(default = "default_application_buckets")]
    pub application_buckets: usize,

    /// Most-recent actions counted per vector
    #[serde(default = "default_action_window")]
    pub action_window: usize,

    /// Metric samples used for rolling statistics
    #[serde(default = "default_metric_window")]
    pub metric_window: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            category_buckets: default_category_buckets(),
            application_buckets: default_application_buckets(),
            action_window: default_action_window(),
            metric_window: default_metric_window(),
        }
    }
}

fn default_category_buckets() -> usize {
    8
}

fn default_application_buckets() -> usize {
    16
}

fn default_action_window() -> usize {
    20
}

fn default_metric_window() -> usize {
    10
}

/// Model training policy
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Minimum examples before the behavior predictor trains
    #[serde(default = "default_min_samples")]
    pub behavior_min_samples: usize,

    /// Minimum examples before the system optimizer trains
    #[serde(default = "default_min_samples")]
    pub optimizer_min_samples: usize,

    /// Metric samples ahead the optimizer forecasts
    #[serde(default = "default_forecast_horizon")]
    pub forecast_horizon: usize,

    /// L2 penalty for the optimizer regressor
    #[serde(default = "default_ridge_penalty")]
    pub ridge_penalty: f64,

    /// Trailing share of examples held out for scoring
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,

    /// Actions whose best posterior is below this are anomalies
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,

    /// Newest buffered actions examined for anomalies
    #[serde(default = "default_anomaly_window")]
    pub anomaly_window: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            behavior_min_samples: default_min_samples(),
            optimizer_min_samples: default_min_samples(),
            forecast_horizon: default_forecast_horizon(),
            ridge_penalty: default_ridge_penalty(),
            holdout_fraction: default_holdout_fraction(),
            anomaly_threshold: default_anomaly_threshold(),
            anomaly_window: default_anomaly_window(),
        }
    }
}

fn default_min_samples() -> usize {
    10
}

fn default_forecast_horizon() -> usize {
    1
}

fn default_ridge_penalty() -> f64 {
    1.0
}

fn default_holdout_fraction() -> f64 {
    0.2
}

fn default_anomaly_threshold() -> f64 {
    0.05
}

fn default_anomaly_window() -> usize {
    100
}

/// Retraining scheduler policy
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Seconds between scheduled retraining attempts
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Seconds between metric samples in the daemon
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,

    /// New samples required since the last successful training
    #[serde(default = "default_min_new_samples")]
    pub min_new_samples: usize,

    /// Bound for scheduled and manual runs
    #[serde(default = "default_training_timeout_secs")]
    pub training_timeout_secs: u64,

    /// Bound for the run triggered at shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Retraining records kept in the database and JSON journal
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            sample_interval_secs: default_sample_interval_secs(),
            min_new_samples: default_min_new_samples(),
            training_timeout_secs: default_training_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            history_limit: default_history_limit(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }

    pub fn training_timeout(&self) -> Duration {
        Duration::from_secs(self.training_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_sample_interval_secs() -> u64 {
    60
}

fn default_min_new_samples() -> usize {
    5
}

fn default_training_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    60
}

fn default_history_limit() -> usize {
    50
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

        config.validate()?;
        Ok(config)
    }

    /// Reject policy values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.buffers.action_capacity == 0 || self.buffers.metric_capacity == 0 {
            return Err(Error::Config(
                "buffers.action_capacity and buffers.metric_capacity must be positive".to_string(),
            ));
        }
        if self.features.category_buckets == 0 || self.features.application_buckets == 0 {
            return Err(Error::Config(
                "features.category_buckets and features.application_buckets must be positive"
                    .to_string(),
            ));
        }
        if self.persistence.max_attempts == 0 {
            return Err(Error::Config(
                "persistence.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.models.holdout_fraction) {
            return Err(Error::Config(
                "models.holdout_fraction must be between 0.0 and 0.5".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.models.anomaly_threshold) {
            return Err(Error::Config(
                "models.anomaly_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.persistence.retention_days > MAX_RETENTION_DAYS {
            return Err(Error::Config(format!(
                "persistence.retention_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.models.forecast_horizon == 0 {
            return Err(Error::Config(
                "models.forecast_horizon must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/foresight/config.toml` (~/.config/foresight/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_dir("XDG_CONFIG_HOME").join("foresight").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/foresight/` (~/.local/share/foresight/)
    pub fn data_dir() -> PathBuf {
        xdg_dir("XDG_DATA_HOME").join("foresight")
    }

    /// Returns the state directory path (for logs and the retraining journal)
    ///
    /// `$XDG_STATE_HOME/foresight/` (~/.local/state/foresight/)
    pub fn state_dir() -> PathBuf {
        xdg_dir("XDG_STATE_HOME").join("foresight")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/foresight/foresight.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("foresight.db")
    }

    /// Base path of the rolling log; each file carries a date suffix
    ///
    /// `$XDG_STATE_HOME/foresight/foresight.log.YYYY-MM-DD`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("foresight.log")
    }

    /// Pin the XDG variables to their resolved values.
    ///
    /// Binaries call this first so every later path lookup agrees.
    pub fn ensure_xdg_env() {
        for (var, _) in XDG_DIRS {
            if std::env::var_os(var).map_or(true, |v| v.is_empty()) {
                std::env::set_var(var, xdg_dir(var));
            }
        }
    }
}
