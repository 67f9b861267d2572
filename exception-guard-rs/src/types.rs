//! # Exception Model
//!
//! Tagged-variant representation of everything the guard can observe: a
//! declared name, a message, an optional concrete discriminator used for
//! handler overrides, and the closed set of kinds the classifier assigns.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classifier::classify;

/// Declared exception names understood by the classifier
pub mod names {
    /// Plain error with no more specific name
    pub const ERROR: &str = "Error";
    /// Operation applied to a value of the wrong type
    pub const TYPE_ERROR: &str = "TypeError";
    /// Numeric value outside its allowed range
    pub const RANGE_ERROR: &str = "RangeError";
    /// Malformed source or document
    pub const SYNTAX_ERROR: &str = "SyntaxError";
    /// Reference to something that does not exist
    pub const REFERENCE_ERROR: &str = "ReferenceError";
    /// Cancelled or timed out operation
    pub const ABORT_ERROR: &str = "AbortError";
    /// Transport level failure
    pub const NETWORK_ERROR: &str = "NetworkError";
    /// Non-success HTTP status
    pub const HTTP_ERROR: &str = "HttpError";
    /// I/O failure
    pub const IO_ERROR: &str = "IoError";
    /// A panic that escaped its calling frames
    pub const PANIC: &str = "Panic";
}

/// The closed set of categories an exception is classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    /// Access through a null or undefined value
    NullReference,
    /// Value used as something it is not
    TypeMismatch,
    /// Value outside its allowed range
    RangeError,
    /// Malformed input
    SyntaxError,
    /// Unresolved reference
    ReferenceError,
    /// Transport, cancellation or timeout failure
    NetworkError,
    /// Payload could not be interpreted
    DataError,
    /// Memory or resource pressure
    ResourceError,
    /// Anything else
    General,
}

impl ExceptionKind {
    /// Every kind, in declaration order
    pub const ALL: [ExceptionKind; 9] = [
        ExceptionKind::NullReference,
        ExceptionKind::TypeMismatch,
        ExceptionKind::RangeError,
        ExceptionKind::SyntaxError,
        ExceptionKind::ReferenceError,
        ExceptionKind::NetworkError,
        ExceptionKind::DataError,
        ExceptionKind::ResourceError,
        ExceptionKind::General,
    ];

    /// Stable snake_case label, used for metrics keys and serialization
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionKind::NullReference => "null_reference",
            ExceptionKind::TypeMismatch => "type_mismatch",
            ExceptionKind::RangeError => "range_error",
            ExceptionKind::SyntaxError => "syntax_error",
            ExceptionKind::ReferenceError => "reference_error",
            ExceptionKind::NetworkError => "network_error",
            ExceptionKind::DataError => "data_error",
            ExceptionKind::ResourceError => "resource_error",
            ExceptionKind::General => "general",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity tag attached to a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic or self-healing
    Low,
    /// Degrades a feature
    #[default]
    Medium,
    /// Breaks a feature
    High,
    /// Breaks the application
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// An observed exception
///
/// `name` drives classification; `discriminator` is the concrete type key a
/// handler can be registered under. When no discriminator is set the name
/// doubles as the concrete key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct Exception {
    /// Declared name, e.g. `TypeError`
    pub name: String,
    /// Human-readable message
    pub message: String,
    /// Concrete type key for handler overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    /// HTTP status associated with the failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Arbitrary structured details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Exception {
    /// Creates an exception with the given declared name and message
    pub fn new<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            discriminator: None,
            status: None,
            details: None,
        }
    }

    /// Creates a plain `Error`-named exception
    pub fn general<M: Into<String>>(message: M) -> Self {
        Self::new(names::ERROR, message)
    }

    /// Sets the concrete discriminator
    pub fn with_discriminator<S: Into<String>>(mut self, discriminator: S) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    /// Sets the associated HTTP status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The key used for concrete-type handler lookup
    pub fn type_key(&self) -> &str {
        self.discriminator.as_deref().unwrap_or(&self.name)
    }

    /// Classifies this exception
    pub fn kind(&self) -> ExceptionKind {
        classify(self)
    }

    /// Coerces an arbitrary thrown value into an exception
    ///
    /// Objects already shaped like an exception (`name` and `message` string
    /// fields) are kept as they are; any other value becomes the message of a
    /// plain `Error`.
    pub fn from_value(value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = &value {
            if map.get("name").map_or(false, |v| v.is_string())
                && map.get("message").map_or(false, |v| v.is_string())
            {
                if let Ok(exception) = serde_json::from_value::<Exception>(value.clone()) {
                    return exception;
                }
            }
        }

        let message = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Self::general(message)
    }

    /// Builds an exception from a panic payload
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        if let Some(exception) = payload.downcast_ref::<Exception>() {
            return exception.clone();
        }
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(names::PANIC, message)
    }

    /// Builds an exception from any error, recognizing the error types the
    /// guard knows how to name
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        if let Some(exception) = err.downcast_ref::<Exception>() {
            return exception.clone();
        }
        if let Some(err) = err.downcast_ref::<reqwest::Error>() {
            return Self::from_reqwest(err);
        }
        if let Some(err) = err.downcast_ref::<serde_json::Error>() {
            return Self::from_json(err);
        }
        if let Some(err) = err.downcast_ref::<std::io::Error>() {
            return Self::new(names::IO_ERROR, err.to_string())
                .with_discriminator("std::io::Error");
        }
        Self::general(err.to_string())
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        let exception = if err.is_timeout() {
            Self::new(names::ABORT_ERROR, format!("request timeout: {}", err))
        } else {
            Self::new(names::NETWORK_ERROR, format!("network request failed: {}", err))
        };
        let exception = exception.with_discriminator("reqwest::Error");
        match err.status() {
            Some(status) => exception.with_status(status.as_u16()),
            None => exception,
        }
    }

    fn from_json(err: &serde_json::Error) -> Self {
        use serde_json::error::Category;

        let exception = match err.classify() {
            Category::Syntax | Category::Eof => {
                Self::new(names::SYNTAX_ERROR, format!("JSON parse error: {}", err))
            }
            Category::Data | Category::Io => {
                Self::general(format!("JSON data error: {}", err))
            }
        };
        exception.with_discriminator("serde_json::Error")
    }
}

impl From<reqwest::Error> for Exception {
    fn from(err: reqwest::Error) -> Self {
        Self::from_reqwest(&err)
    }
}

impl From<serde_json::Error> for Exception {
    fn from(err: serde_json::Error) -> Self {
        Self::from_json(&err)
    }
}

impl From<std::io::Error> for Exception {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(&err)
    }
}

impl From<anyhow::Error> for Exception {
    fn from(err: anyhow::Error) -> Self {
        if let Some(exception) = err.downcast_ref::<Exception>() {
            return exception.clone();
        }
        let inner: &(dyn StdError + 'static) = err.as_ref();
        let mut exception = Self::from_error(inner);
        // anyhow's Display includes attached context; keep the full chain
        exception.message = format!("{:#}", err);
        exception
    }
}

impl From<String> for Exception {
    fn from(value: String) -> Self {
        Self::from_value(serde_json::Value::String(value))
    }
}

impl From<&str> for Exception {
    fn from(value: &str) -> Self {
        Self::from_value(serde_json::Value::String(value.to_string()))
    }
}

impl From<serde_json::Value> for Exception {
    fn from(value: serde_json::Value) -> Self {
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exception_creation() {
        let exc = Exception::new(names::TYPE_ERROR, "x is not a function")
            .with_discriminator("WidgetError")
            .with_status(500);

        assert_eq!(exc.name, "TypeError");
        assert_eq!(exc.type_key(), "WidgetError");
        assert_eq!(exc.status, Some(500));
        assert_eq!(exc.to_string(), "TypeError: x is not a function");
    }

    #[test]
    fn test_type_key_defaults_to_name() {
        let exc = Exception::new(names::RANGE_ERROR, "index 9 out of range");
        assert_eq!(exc.type_key(), "RangeError");
    }

    #[test]
    fn test_thrown_string_is_coerced() {
        let exc = Exception::from("something broke");
        assert_eq!(exc.name, names::ERROR);
        assert_eq!(exc.message, "something broke");
    }

    #[test]
    fn test_thrown_number_is_coerced() {
        let exc = Exception::from_value(json!(42));
        assert_eq!(exc.name, names::ERROR);
        assert_eq!(exc.message, "42");
    }

    #[test]
    fn test_error_shaped_object_is_kept() {
        let exc = Exception::from_value(json!({
            "name": "RangeError",
            "message": "too big"
        }));
        assert_eq!(exc.name, "RangeError");
        assert_eq!(exc.message, "too big");
    }

    #[test]
    fn test_panic_payloads() {
        let static_payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(Exception::from_panic(static_payload.as_ref()).message, "boom");

        let owned_payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        let exc = Exception::from_panic(owned_payload.as_ref());
        assert_eq!(exc.name, names::PANIC);
        assert_eq!(exc.message, "owned boom");
    }

    #[test]
    fn test_json_errors_are_named() {
        let syntax = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let exc = Exception::from(syntax);
        assert_eq!(exc.name, names::SYNTAX_ERROR);
        assert!(exc.message.contains("JSON"));

        let data = serde_json::from_str::<Vec<u32>>("{\"a\": 1}").unwrap_err();
        let exc = Exception::from(data);
        assert_eq!(exc.name, names::ERROR);
        assert_eq!(exc.kind(), ExceptionKind::DataError);
    }

    #[test]
    fn test_anyhow_round_trips_exception() {
        let original = Exception::new(names::REFERENCE_ERROR, "foo is not defined");
        let wrapped = anyhow::Error::new(original.clone());
        assert_eq!(Exception::from(wrapped), original);
    }

    #[test]
    fn test_severity_default_is_medium() {
        assert_eq!(Severity::default(), Severity::Medium);
    }
}
