//! # Guard Settings
//!
//! The process-wide settings surface: protection level, log verbosity and
//! the numeric defaults the request engine and host UI read. Updates merge
//! field by field; `reset` restores the documented defaults.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Prefix of the environment variables the settings loader reads
pub const ENV_PREFIX: &str = "EXCEPTION_GUARD";

/// How much of the guard is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionLevel {
    /// Nothing is intercepted
    None,
    /// Escape channels are intercepted
    Basic,
    /// Escape channels and request resilience
    #[default]
    Advanced,
    /// Everything, with verbose reporting
    Strict,
}

impl FromStr for ProtectionLevel {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ProtectionLevel::None),
            "basic" => Ok(ProtectionLevel::Basic),
            "advanced" => Ok(ProtectionLevel::Advanced),
            "strict" => Ok(ProtectionLevel::Strict),
            other => Err(GuardError::InvalidSetting {
                key: "protection_level".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Verbosity of the exception log's own tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Silent
    None,
    /// Only records, at error level
    #[default]
    Error,
    /// Records and warnings
    Warn,
    /// Adds informational events
    Info,
    /// Adds record payloads
    Debug,
}

impl FromStr for LogLevel {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(LogLevel::None),
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(GuardError::InvalidSetting {
                key: "log_level".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::None => "none",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        f.write_str(s)
    }
}

/// Recognized settings and their defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSettings {
    /// How much of the guard is active
    pub protection_level: ProtectionLevel,
    /// Verbosity of the log's tracing output
    pub log_level: LogLevel,
    /// Per-attempt request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Retries after the first request attempt
    pub max_retry_count: u32,
    /// Base backoff delay in milliseconds
    pub initial_retry_delay_ms: u64,
    /// Item count above which hosts switch to virtual scrolling
    pub max_task_count: usize,
    /// Memory usage in megabytes above which hosts report pressure
    pub memory_threshold_mb: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            protection_level: ProtectionLevel::Advanced,
            log_level: LogLevel::Error,
            request_timeout_ms: 10_000,
            max_retry_count: 3,
            initial_retry_delay_ms: 1_000,
            max_task_count: 100,
            memory_threshold_mb: 100,
        }
    }
}

impl GuardSettings {
    /// Per-attempt request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Base backoff delay
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    /// Merges every field set in the patch
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(level) = patch.protection_level {
            self.protection_level = level;
        }
        if let Some(level) = patch.log_level {
            self.log_level = level;
        }
        if let Some(timeout) = patch.request_timeout_ms {
            self.request_timeout_ms = timeout;
        }
        if let Some(count) = patch.max_retry_count {
            self.max_retry_count = count;
        }
        if let Some(delay) = patch.initial_retry_delay_ms {
            self.initial_retry_delay_ms = delay;
        }
        if let Some(count) = patch.max_task_count {
            self.max_task_count = count;
        }
        if let Some(threshold) = patch.memory_threshold_mb {
            self.memory_threshold_mb = threshold;
        }
    }

    /// Loads settings from an optional TOML file and `EXCEPTION_GUARD__*`
    /// environment variables, after reading a `.env` file if one exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        GuardSettings::try_from(cfg)
    }
}

impl TryFrom<config::Config> for GuardSettings {
    type Error = GuardError;

    fn try_from(cfg: config::Config) -> Result<Self> {
        // Start from defaults and selectively override from the provided config.
        let mut base = GuardSettings::default();

        if let Ok(level) = cfg.get::<String>("protection_level") {
            base.protection_level = level.parse()?;
        }
        if let Ok(level) = cfg.get::<String>("log_level") {
            base.log_level = level.parse()?;
        }
        if let Ok(timeout) = cfg.get::<u64>("request_timeout_ms") {
            base.request_timeout_ms = timeout;
        }
        if let Ok(count) = cfg.get::<u32>("max_retry_count") {
            base.max_retry_count = count;
        }
        if let Ok(delay) = cfg.get::<u64>("initial_retry_delay_ms") {
            base.initial_retry_delay_ms = delay;
        }
        if let Ok(count) = cfg.get::<usize>("max_task_count") {
            base.max_task_count = count;
        }
        if let Ok(threshold) = cfg.get::<u64>("memory_threshold_mb") {
            base.memory_threshold_mb = threshold;
        }

        Ok(base)
    }
}

/// A partial settings update; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub protection_level: Option<ProtectionLevel>,
    pub log_level: Option<LogLevel>,
    pub request_timeout_ms: Option<u64>,
    pub max_retry_count: Option<u32>,
    pub initial_retry_delay_ms: Option<u64>,
    pub max_task_count: Option<usize>,
    pub memory_threshold_mb: Option<u64>,
}

/// Shared, mutable settings
#[derive(Debug, Default)]
pub struct SettingsStore {
    inner: RwLock<GuardSettings>,
}

impl SettingsStore {
    /// Creates a store holding the given settings
    pub fn new(settings: GuardSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// A copy of the current settings
    pub fn get(&self) -> GuardSettings {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Merges a patch into the current settings and returns the result
    pub fn update(&self, patch: &SettingsPatch) -> GuardSettings {
        let mut settings = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        settings.apply(patch);
        tracing::debug!(settings = ?*settings, "Settings updated");
        settings.clone()
    }

    /// Restores the documented defaults
    pub fn reset(&self) -> GuardSettings {
        let mut settings = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *settings = GuardSettings::default();
        settings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = GuardSettings::default();
        assert_eq!(settings.protection_level, ProtectionLevel::Advanced);
        assert_eq!(settings.log_level, LogLevel::Error);
        assert_eq!(settings.request_timeout(), Duration::from_secs(10));
        assert_eq!(settings.max_retry_count, 3);
        assert_eq!(settings.initial_retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_update_merges_and_reset_restores() {
        let store = SettingsStore::default();

        let updated = store.update(&SettingsPatch {
            log_level: Some(LogLevel::Debug),
            max_retry_count: Some(5),
            ..Default::default()
        });
        assert_eq!(updated.log_level, LogLevel::Debug);
        assert_eq!(updated.max_retry_count, 5);
        assert_eq!(updated.request_timeout_ms, 10_000);

        let updated = store.update(&SettingsPatch {
            request_timeout_ms: Some(2_000),
            ..Default::default()
        });
        assert_eq!(updated.log_level, LogLevel::Debug);
        assert_eq!(updated.request_timeout_ms, 2_000);

        assert_eq!(store.reset(), GuardSettings::default());
        assert_eq!(store.get(), GuardSettings::default());
    }

    #[test]
    fn test_parse_levels() {
        assert_eq!("Strict".parse::<ProtectionLevel>().unwrap(), ProtectionLevel::Strict);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "protection_level = \"strict\"").unwrap();
        writeln!(file, "max_retry_count = 5").unwrap();
        writeln!(file, "request_timeout_ms = 2500").unwrap();

        let settings = GuardSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.protection_level, ProtectionLevel::Strict);
        assert_eq!(settings.max_retry_count, 5);
        assert_eq!(settings.request_timeout_ms, 2500);
        assert_eq!(settings.initial_retry_delay_ms, 1_000);
    }

    #[test]
    fn test_invalid_level_in_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "log_level = \"shouting\"").unwrap();

        let err = GuardSettings::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, GuardError::InvalidSetting { .. }));
    }
}
