//! # Crate Error Type
//!
//! Errors raised by the guard's own setup and I/O paths. Exceptions observed
//! at runtime are never returned through this type: they are `Exception`
//! values routed to the log.

use thiserror::Error;

/// A type alias for Result with the error type defaulting to `GuardError`
pub type Result<T, E = GuardError> = std::result::Result<T, E>;

/// Failures of the guard's own operations
#[derive(Debug, Error)]
pub enum GuardError {
    /// Settings could not be loaded or deserialized
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A settings value was outside its recognized set
    #[error("invalid setting `{key}`: {value}")]
    InvalidSetting { key: String, value: String },

    /// The tracing subscriber could not be installed
    #[error("logging initialization failed: {0}")]
    Logging(String),

    /// The HTTP transport could not be constructed
    #[error("transport initialization failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Serializing log contents failed
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_setting_display() {
        let err = GuardError::InvalidSetting {
            key: "log_level".to_string(),
            value: "loud".to_string(),
        };
        assert_eq!(err.to_string(), "invalid setting `log_level`: loud");
    }
}
