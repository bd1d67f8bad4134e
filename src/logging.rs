/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{Result, RmemError};

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(config)?;

    if let Some(ref log_path) = config.file {
        init_file_logging(log_path, env_filter)
    } else {
        init_stdout_logging(env_filter)
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let level = config.level.to_tracing_level();
    EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "rmem={level},rmem_connect={level},rmem_service={level},rmem_core_resilience={level}"
            ))
        })
        .map_err(|e| RmemError::Config(format!("Failed to create log filter: {}", e)))
}

/// Initialize logging to stdout/stderr
fn init_stdout_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| RmemError::Config(format!("Failed to install logger: {}", e)))
}

/// Initialize logging to a file
fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| RmemError::Config(format!("Failed to create log file: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false) // No ANSI colors in file
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| RmemError::Config(format!("Failed to install logger: {}", e)))
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("rmem=debug,rmem_connect=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}
