//! # Capture Context
//!
//! A context label plus a structured payload travels with every exception
//! from the point of capture to the log record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Context label for panics escaping all calling frames
pub const UNCAUGHT_ERROR: &str = "uncaught-error";
/// Context label for failed detached tasks nobody observed
pub const UNHANDLED_REJECTION: &str = "unhandled-rejection";
/// Context label for failures raised by a registered handler
pub const HANDLER_FAILURE: &str = "handler-failure";
/// Context label for primary request attempts
pub const SAFE_FETCH: &str = "safe-fetch";
/// Context label for the fallback endpoint attempt
pub const SAFE_FETCH_FALLBACK: &str = "safe-fetch-fallback";
/// Context label for exceptions caught by a component boundary
pub const COMPONENT_BOUNDARY: &str = "component-boundary";
/// Context label for the synchronous wrapping combinator
pub const WRAPPED_SYNC: &str = "wrapped-sync";
/// Context label for the asynchronous wrapping combinator
pub const WRAPPED_ASYNC: &str = "wrapped-async";
/// Default context label for direct dispatch
pub const DISPATCH: &str = "dispatch";

/// Where and under which circumstances an exception was captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Short label naming the capture site
    pub label: String,
    /// Additional structured data
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Context {
    /// Creates a context with the given label and no data
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
            data: serde_json::Map::new(),
        }
    }

    /// Adds a key-value pair to the context
    pub fn add<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.insert(key.into(), value);
        }
        self
    }

    /// Merges every entry of a JSON object into the context data; any other
    /// value is stored under `extra`
    pub fn extend(mut self, extra: serde_json::Value) -> Self {
        match extra {
            serde_json::Value::Object(map) => self.data.extend(map),
            serde_json::Value::Null => {}
            other => {
                self.data.insert("extra".to_string(), other);
            }
        }
        self
    }

    /// The data as a JSON value
    pub fn payload(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone())
    }
}

impl From<&str> for Context {
    fn from(label: &str) -> Self {
        Context::new(label)
    }
}

impl From<String> for Context {
    fn from(label: String) -> Self {
        Context::new(label)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)?;

        if !self.data.is_empty() {
            write!(f, " [")?;
            let mut first = true;
            for (k, v) in &self.data {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", k, v)?;
                first = false;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_creation() {
        let ctx = Context::new(SAFE_FETCH)
            .add("url", "https://api.example.com/items")
            .add("attempt", 2);

        assert_eq!(ctx.label, "safe-fetch");
        assert_eq!(ctx.data.len(), 2);
        assert_eq!(ctx.payload()["attempt"], json!(2));
    }

    #[test]
    fn test_extend_merges_objects() {
        let ctx = Context::new(DISPATCH).extend(json!({"a": 1, "b": "two"}));
        assert_eq!(ctx.data.len(), 2);

        let ctx = Context::new(DISPATCH).extend(json!("loose"));
        assert_eq!(ctx.data.get("extra"), Some(&json!("loose")));

        let ctx = Context::new(DISPATCH).extend(serde_json::Value::Null);
        assert!(ctx.data.is_empty());
    }

    #[test]
    fn test_display() {
        let ctx = Context::new("component-boundary").add("component", "Sidebar");
        assert_eq!(ctx.to_string(), "component-boundary [component: \"Sidebar\"]");
    }
}
