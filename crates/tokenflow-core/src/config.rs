//! Configuration loading and typed config structures for the engine.
//!
//! The configuration lives in `tokenflow.yaml`. Every field has a default,
//! so an empty file (or no file at all) yields a working engine.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::snapshot::SnapshotStrategy;

/// Environment variable that overrides `logging.level`.
pub const LOG_LEVEL_ENV: &str = "TOKENFLOW_LOG_LEVEL";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Tick clock settings.
    #[serde(default)]
    pub clock: ClockConfig,

    /// Replay and snapshot policy.
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `TOKENFLOW_LOG_LEVEL` overrides `logging.level`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.logging.apply_env_overrides();
        Ok(config)
    }
}

/// Tick clock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClockConfig {
    /// Simulation time of tick 0.
    #[serde(default)]
    pub epoch: DateTime<Utc>,

    /// Milliseconds of simulation time per tick.
    #[serde(default = "default_tick_duration_ms")]
    pub tick_duration_ms: u64,
}

const fn default_tick_duration_ms() -> u64 {
    1000
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            epoch: DateTime::<Utc>::default(),
            tick_duration_ms: default_tick_duration_ms(),
        }
    }
}

/// Replay engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplayConfig {
    /// When to capture snapshots.
    #[serde(default)]
    pub snapshot_strategy: SnapshotStrategy,

    /// Capture every Nth event under [`SnapshotStrategy::EveryN`].
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: usize,

    /// Maximum snapshots retained; oldest evicted first.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,

    /// Upper bound on steps taken by `replay_all`.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

const fn default_snapshot_interval() -> usize {
    10
}

const fn default_max_snapshots() -> usize {
    100
}

const fn default_max_steps() -> usize {
    100_000
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            snapshot_strategy: SnapshotStrategy::default(),
            snapshot_interval: default_snapshot_interval(),
            max_snapshots: default_max_snapshots(),
            max_steps: default_max_steps(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl LoggingConfig {
    /// Apply the `TOKENFLOW_LOG_LEVEL` override, if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(LOG_LEVEL_ENV) {
            self.level = val;
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
