//! Monitor configuration.
//!
//! One [`MonitorConfig`] is built at startup from defaults, an optional TOML
//! file, and CLI overrides, then passed by reference to every component.
//!
//! ```toml
//! subject = "Spotify"
//! poll_interval_secs = 3
//! idle_after_ms = 400
//!
//! [escalation]
//! window = 5
//! idle_threshold = 8.0
//! busy_threshold = 25.0
//! statistic = "median"
//! breach_allowance = 3
//! grace_ticks = 2
//! force = false
//!
//! [metrics]
//! influx_url = "http://localhost:8086"
//! database = "cpuwatch"
//! ```

pub mod resolve;

pub use resolve::{resolve_config_path, resolve_with, ConfigSource, CONFIG_ENV};

use crate::collect::{CollectorConfig, ProducerSpec};
use crate::daemon::escalation::EscalationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl From<ConfigError> for cw_common::Error {
    fn from(err: ConfigError) -> Self {
        cw_common::Error::Config(err.to_string())
    }
}

/// Metrics export settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// InfluxDB base URL; export is off when unset.
    pub influx_url: Option<String>,
    pub database: String,
    pub timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            influx_url: None,
            database: "cpuwatch".to_string(),
            timeout_ms: 2000,
        }
    }
}

/// Everything the monitor needs, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Exact command name of the watched process; also the app name given
    /// to the state and quit scripts. Related processes share this prefix.
    pub subject: String,
    /// Seconds between `top` samples.
    pub poll_interval_secs: u64,
    /// Quiet time that ends one burst of `top` output.
    pub idle_after_ms: u64,
    /// Print every matching process each tick.
    pub verbose: bool,
    /// Log remediation instead of acting.
    pub dry_run: bool,
    pub escalation: EscalationConfig,
    pub metrics: MetricsConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            subject: "Spotify".to_string(),
            poll_interval_secs: 3,
            idle_after_ms: 400,
            verbose: false,
            dry_run: false,
            escalation: EscalationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_millis(self.idle_after_ms)
    }

    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read and parse a config file. Does not validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Load from `source`, or defaults when it names no file.
    pub fn from_source(source: &ConfigSource) -> Result<Self, ConfigError> {
        match source.path() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check semantic constraints the types cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject.trim().is_empty() {
            return Err(ConfigError::Invalid("subject must not be empty".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.idle_after_ms == 0 || self.idle_after() >= self.poll_interval() {
            return Err(ConfigError::Invalid(format!(
                "idle_after_ms ({}) must be positive and shorter than the polling interval ({} s)",
                self.idle_after_ms, self.poll_interval_secs
            )));
        }
        if self.metrics.database.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "metrics.database must not be empty".to_string(),
            ));
        }
        self.escalation
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Collector settings for `top` at the configured interval.
    pub fn collector_config(&self) -> Result<CollectorConfig, ConfigError> {
        CollectorConfig::new(
            ProducerSpec::top(self.poll_interval()),
            self.poll_interval(),
            self.idle_after(),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
