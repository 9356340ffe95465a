//! TOML configuration
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use crate::collectors::{ParseFailurePolicy, TailerConfig};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tail: TailSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub alert: AlertSettings,
}

/// Which file to follow and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailSettings {
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_true")]
    pub start_at_end: bool,
    #[serde(default)]
    pub parse_failure_policy: ParseFailurePolicy,
}

/// Section statistics window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSettings {
    #[serde(default = "default_report_window")]
    pub window_seconds: u64,
}

/// Traffic volume alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default = "default_alert_name")]
    pub name: String,
    #[serde(default = "default_alert_window")]
    pub window_seconds: u64,
    /// Hits within the window that trigger the alert
    #[serde(default = "default_threshold")]
    pub threshold: u64,
}

// --- Defaults ---

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/access.log")
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_buffer_capacity() -> usize {
    crate::collectors::DEFAULT_BUFFER_CAPACITY
}

const fn default_true() -> bool {
    true
}

const fn default_report_window() -> u64 {
    10
}

fn default_alert_name() -> String {
    "high traffic".into()
}

const fn default_alert_window() -> u64 {
    120
}

const fn default_threshold() -> u64 {
    1200
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            poll_interval_ms: default_poll_interval_ms(),
            buffer_capacity: default_buffer_capacity(),
            start_at_end: true,
            parse_failure_policy: ParseFailurePolicy::default(),
        }
    }
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            window_seconds: default_report_window(),
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            name: default_alert_name(),
            window_seconds: default_alert_window(),
            threshold: default_threshold(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// `ReadError` if the file does not exist, `IoError` if it cannot be read,
    /// `ParseError` for invalid TOML and `ValidationError` for bad values.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ConfigError::ReadError(format!("{}: {}", path.display(), e))
            }
            _ => ConfigError::IoError(e),
        })?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value can drive the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tail.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "tail.path must not be empty".to_string(),
            ));
        }
        if self.tail.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "tail.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.tail.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "tail.buffer_capacity must be greater than 0".to_string(),
            ));
        }
        if self.report.window_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "report.window_seconds must be greater than 0".to_string(),
            ));
        }
        if self.alert.window_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "alert.window_seconds must be greater than 0".to_string(),
            ));
        }
        if self.alert.threshold == 0 {
            return Err(ConfigError::ValidationError(
                "alert.threshold must be greater than 0".to_string(),
            ));
        }
        if self.alert.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "alert.name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn report_window(&self) -> Duration {
        Duration::from_secs(self.report.window_seconds)
    }

    pub fn alert_window(&self) -> Duration {
        Duration::from_secs(self.alert.window_seconds)
    }

    /// Tailer settings derived from the `[tail]` section
    pub fn tailer_config(&self) -> TailerConfig {
        TailerConfig {
            poll_interval: Duration::from_millis(self.tail.poll_interval_ms),
            buffer_capacity: self.tail.buffer_capacity,
            start_at_end: self.tail.start_at_end,
            parse_failure_policy: self.tail.parse_failure_policy,
        }
    }
}
