//! # Structured Logging
//!
//! Installs the global `tracing` subscriber used by the guard: an `EnvFilter`
//! seeded from the guard's log level, JSON or text formatting, and an
//! optional daily rolling log file.

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::error::{GuardError, Result};
use crate::settings::LogLevel;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Dropping the guard stops the background file writer
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// Application name, used for the log file name
    pub app_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Whether to also write to a daily rolling file
    pub file_output: bool,
    /// The directory to store log files in
    pub log_dir: Option<String>,
    /// Whether to include file and line of each event
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "error".to_string(),
            app_name: "exception-guard".to_string(),
            json_format: true,
            file_output: false,
            log_dir: None,
            include_location: true,
        }
    }
}

impl LoggingConfig {
    /// Derives the filter directive from the guard's log level
    pub fn for_log_level(level: LogLevel) -> Self {
        Self {
            level: filter_directive(level).to_string(),
            ..Self::default()
        }
    }
}

/// Maps the guard's log level onto a tracing filter directive
pub fn filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::None => "off",
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    }
}

/// True once a subscriber has been installed by [`init_logging`]
pub fn is_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::SeqCst)
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| GuardError::Logging(format!("invalid filter '{}': {}", config.level, e)))?;

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
    });

    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
    });

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.app_name),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| GuardError::Logging(format!("failed to set global subscriber: {}", e)))?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        app = %config.app_name,
        level = %config.level,
        json = config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_follows_log_level() {
        assert_eq!(filter_directive(LogLevel::None), "off");
        assert_eq!(filter_directive(LogLevel::Warn), "warn");
        assert_eq!(LoggingConfig::for_log_level(LogLevel::Debug).level, "debug");
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"level": "info", "json_format": false}"#).unwrap();
        assert_eq!(config.level, "info");
        assert!(!config.json_format);
        assert_eq!(config.app_name, "exception-guard");
        assert!(!config.file_output);
    }
}
