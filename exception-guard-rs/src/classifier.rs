//! # Exception Classification
//!
//! Maps an exception to exactly one `ExceptionKind` using its declared name
//! and message. Checks run in a fixed order and the first match wins, since
//! the message checks overlap.
//!
//! The registry and the log both classify through [`classify`].

use crate::types::{names, Exception, ExceptionKind};

const NETWORK_VOCABULARY: [&str; 3] = ["fetch", "network", "timeout"];
const RESOURCE_VOCABULARY: [&str; 2] = ["memory", "DOM"];

/// Classifies an exception. Pure and total; `General` is the catch-all.
pub fn classify(exception: &Exception) -> ExceptionKind {
    let name = exception.name.as_str();
    let message = exception.message.as_str();

    if name == names::TYPE_ERROR {
        if message.contains("null") || message.contains("undefined") {
            return ExceptionKind::NullReference;
        }
        if message.contains("is not a function") {
            return ExceptionKind::TypeMismatch;
        }
    }

    match name {
        names::RANGE_ERROR => return ExceptionKind::RangeError,
        names::SYNTAX_ERROR => return ExceptionKind::SyntaxError,
        names::REFERENCE_ERROR => return ExceptionKind::ReferenceError,
        names::ABORT_ERROR => return ExceptionKind::NetworkError,
        _ => {}
    }

    if NETWORK_VOCABULARY.iter().any(|word| message.contains(word)) {
        return ExceptionKind::NetworkError;
    }
    if message.contains("JSON") {
        return ExceptionKind::DataError;
    }
    if RESOURCE_VOCABULARY.iter().any(|word| message.contains(word)) {
        return ExceptionKind::ResourceError;
    }

    ExceptionKind::General
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exc(name: &str, message: &str) -> Exception {
        Exception::new(name, message)
    }

    #[test]
    fn test_type_error_with_null_is_null_reference() {
        for message in [
            "Cannot read properties of null (reading 'x')",
            "null is not an object",
            "value is null",
        ] {
            assert_eq!(classify(&exc("TypeError", message)), ExceptionKind::NullReference);
        }
    }

    #[test]
    fn test_type_error_with_undefined_is_null_reference() {
        let e = exc("TypeError", "Cannot read properties of undefined");
        assert_eq!(classify(&e), ExceptionKind::NullReference);
    }

    #[test]
    fn test_null_check_precedes_not_a_function() {
        let e = exc("TypeError", "undefined is not a function");
        assert_eq!(classify(&e), ExceptionKind::NullReference);
    }

    #[test]
    fn test_type_error_not_a_function() {
        let e = exc("TypeError", "foo.bar is not a function");
        assert_eq!(classify(&e), ExceptionKind::TypeMismatch);
    }

    #[test]
    fn test_other_type_error_falls_through_to_message_rules() {
        assert_eq!(classify(&exc("TypeError", "Failed to fetch")), ExceptionKind::NetworkError);
        assert_eq!(classify(&exc("TypeError", "bad argument")), ExceptionKind::General);
    }

    #[test]
    fn test_name_rules() {
        assert_eq!(classify(&exc("RangeError", "x")), ExceptionKind::RangeError);
        assert_eq!(classify(&exc("SyntaxError", "Unexpected token in JSON")), ExceptionKind::SyntaxError);
        assert_eq!(classify(&exc("ReferenceError", "x is not defined")), ExceptionKind::ReferenceError);
        assert_eq!(classify(&exc("AbortError", "The user aborted a request")), ExceptionKind::NetworkError);
    }

    #[test]
    fn test_name_rules_precede_message_rules() {
        let e = exc("RangeError", "network buffer out of memory");
        assert_eq!(classify(&e), ExceptionKind::RangeError);
    }

    #[test]
    fn test_network_vocabulary() {
        assert_eq!(classify(&exc("Error", "fetch failed")), ExceptionKind::NetworkError);
        assert_eq!(classify(&exc("Error", "network unreachable")), ExceptionKind::NetworkError);
        assert_eq!(classify(&exc("Error", "request timeout")), ExceptionKind::NetworkError);
    }

    #[test]
    fn test_network_precedes_json() {
        let e = exc("Error", "JSON fetch returned garbage");
        assert_eq!(classify(&e), ExceptionKind::NetworkError);
    }

    #[test]
    fn test_json_is_data_error() {
        assert_eq!(classify(&exc("Error", "Invalid JSON payload")), ExceptionKind::DataError);
    }

    #[test]
    fn test_json_check_is_case_sensitive() {
        assert_eq!(classify(&exc("Error", "invalid json payload")), ExceptionKind::General);
    }

    #[test]
    fn test_json_precedes_resource() {
        let e = exc("Error", "JSON too large for memory");
        assert_eq!(classify(&e), ExceptionKind::DataError);
    }

    #[test]
    fn test_resource_vocabulary() {
        assert_eq!(classify(&exc("Error", "out of memory")), ExceptionKind::ResourceError);
        assert_eq!(classify(&exc("Error", "DOM node limit exceeded")), ExceptionKind::ResourceError);
    }

    #[test]
    fn test_general_fallback() {
        assert_eq!(classify(&exc("Error", "something odd")), ExceptionKind::General);
        assert_eq!(classify(&exc("Panic", "")), ExceptionKind::General);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let e = exc("TypeError", "x is null");
        let first = classify(&e);
        for _ in 0..10 {
            assert_eq!(classify(&e), first);
        }
    }
}
