//! # Payload Sanitization
//!
//! Context payloads often carry request options, headers included. Before a
//! payload is stored in the log, values under sensitive keys and sensitive
//! looking strings are redacted.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

/// Replacement text for redacted values
pub const REDACTED: &str = "[REDACTED]";

// Static regex patterns for sensitive information detection
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // API keys, tokens, credentials
        r#"(?i)(api[_-]?key|token|secret|password|credential)s?["']?\s*[=:]\s*["']?([^"'\s]+)"#,
        // OAuth 2.0 bearer tokens
        r"(?i)bearer\s+([a-zA-Z0-9\._\-]+)",
        // JWTs
        r"eyJ[a-zA-Z0-9\-_]+\.eyJ[a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+",
        // Email addresses
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

// Keys whose values are always redacted
static SENSITIVE_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "password", "secret", "token", "key", "credential", "auth",
        "authorization", "cookie", "session_id", "private_key", "api_key", "access_token",
        "refresh_token",
    ]
    .into_iter()
    .collect()
});

/// Returns a copy of the payload with sensitive data redacted
pub fn sanitize_payload(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sanitized = map
                .iter()
                .map(|(key, value)| {
                    if is_sensitive_key(key) {
                        (key.clone(), serde_json::Value::String(REDACTED.to_string()))
                    } else {
                        (key.clone(), sanitize_payload(value))
                    }
                })
                .collect();
            serde_json::Value::Object(sanitized)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_payload).collect())
        }
        serde_json::Value::String(s) => serde_json::Value::String(sanitize_message(s)),
        other => other.clone(),
    }
}

/// Determines if a payload key is sensitive. Single-word entries match whole
/// segments of the key (`x-api-key`, `authToken`), compound entries match
/// anywhere in it (`db_private_key`).
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = normalize_key(key);

    if SENSITIVE_KEYS.contains(normalized.as_str()) {
        return true;
    }

    SENSITIVE_KEYS.iter().any(|sensitive_key| {
        if sensitive_key.contains('_') {
            normalized.contains(sensitive_key)
        } else {
            normalized.split('_').any(|segment| segment == *sensitive_key)
        }
    })
}

// Lowercases and joins segments with `_`, splitting on `-`, `.` and camelCase
fn normalize_key(key: &str) -> String {
    let mut normalized = String::with_capacity(key.len() + 4);
    let mut previous_lower = false;
    for c in key.chars() {
        match c {
            '-' | '.' | ' ' | '_' => {
                normalized.push('_');
                previous_lower = false;
            }
            c if c.is_uppercase() => {
                if previous_lower {
                    normalized.push('_');
                }
                normalized.extend(c.to_lowercase());
                previous_lower = false;
            }
            c => {
                normalized.push(c);
                previous_lower = c.is_lowercase() || c.is_ascii_digit();
            }
        }
    }
    normalized
}

/// Redacts sensitive fragments of a message
pub fn sanitize_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        sanitized = pattern
            .replace_all(&sanitized, |caps: &regex::Captures| {
                if caps.len() > 2 {
                    // Keep the key name but redact the value
                    format!("{}={}", &caps[1], REDACTED)
                } else if caps.len() == 2 && caps[0].to_lowercase().starts_with("bearer") {
                    format!("Bearer {}", REDACTED)
                } else {
                    REDACTED.to_string()
                }
            })
            .to_string();
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_message() {
        let sensitive = "Failed to connect with api_key=abc123xyz";
        assert_eq!(
            sanitize_message(sensitive),
            "Failed to connect with api_key=[REDACTED]"
        );

        let bearer = "Bearer abc.def-ghi";
        assert_eq!(sanitize_message(bearer), "Bearer [REDACTED]");
    }

    #[test]
    fn test_plain_text_is_untouched() {
        let url = "http://127.0.0.1:8080/items?page=2";
        assert_eq!(sanitize_message(url), url);
    }

    #[test]
    fn test_is_sensitive_key() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("x-api-key"));
        assert!(is_sensitive_key("access_token"));

        assert!(!is_sensitive_key("url"));
        assert!(!is_sensitive_key("attempt"));
        assert!(!is_sensitive_key("headers"));
    }

    #[test]
    fn test_sensitive_words_must_be_whole_segments() {
        assert!(is_sensitive_key("api_key"));
        assert!(is_sensitive_key("X-Api-Key"));
        assert!(is_sensitive_key("apiKey"));
        assert!(is_sensitive_key("authToken"));
        assert!(is_sensitive_key("session_id"));
        assert!(is_sensitive_key("db_private_key"));
        assert!(is_sensitive_key("user.password"));

        assert!(!is_sensitive_key("monkey"));
        assert!(!is_sensitive_key("keyboard"));
        assert!(!is_sensitive_key("author"));
        assert!(!is_sensitive_key("tokenizer"));
    }

    #[test]
    fn test_sanitize_nested_payload() {
        let payload = json!({
            "url": "https://api.example.com/items",
            "attempt": 1,
            "options": {
                "headers": {
                    "Authorization": "Bearer abc",
                    "Accept": "application/json"
                }
            }
        });

        let sanitized = sanitize_payload(&payload);
        assert_eq!(sanitized["url"], json!("https://api.example.com/items"));
        assert_eq!(sanitized["attempt"], json!(1));
        assert_eq!(sanitized["options"]["headers"]["Authorization"], json!(REDACTED));
        assert_eq!(sanitized["options"]["headers"]["Accept"], json!("application/json"));
    }
}
