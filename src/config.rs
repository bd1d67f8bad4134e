/*!
 * Configuration types for rmem
 */

use rmem_core_resilience::{RetryPolicy, DEFAULT_MAX_RETRY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RmemError};

/// Connection and session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmemConfig {
    /// Registry endpoint host
    #[serde(default = "default_host")]
    pub host: String,

    /// Registry endpoint port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Extra connection attempts after the first one
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Delay between connection attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Accept an endpoint speaking a different protocol version
    #[serde(default)]
    pub ignore_version: bool,

    /// Re-establish the connection when used from a different process
    #[serde(default = "default_true")]
    pub process_safe: bool,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RmemConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_retry: default_max_retry(),
            retry_delay_ms: default_retry_delay_ms(),
            ignore_version: false,
            process_safe: true,
            logging: LoggingConfig::default(),
        }
    }
}

/// Diagnostic output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    18812
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_retry_delay_ms() -> u64 {
    3000
}

impl RmemConfig {
    /// Settings for `host:port` with every other field at its default
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RmemConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RmemError::Configuration("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(RmemError::Configuration("port must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Retry policy handed to the connection guardian
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_retry, self.retry_delay());
        if self.ignore_version {
            policy.ignoring_version()
        } else {
            policy
        }
    }

    pub fn with_retry(mut self, max_retry: u32, retry_delay: Duration) -> Self {
        self.max_retry = max_retry;
        self.retry_delay_ms = u64::try_from(retry_delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_process_safe(mut self, process_safe: bool) -> Self {
        self.process_safe = process_safe;
        self
    }

    pub fn with_ignore_version(mut self, ignore_version: bool) -> Self {
        self.ignore_version = ignore_version;
        self
    }
}
