//! Metrics emitted by the guard.
//!
//! Counters go through the `metrics` facade; installing an exporter is left
//! to the host application.

use metrics::counter;

use crate::types::ExceptionKind;

/// Counts a record written to the exception log
pub fn record_exception(kind: ExceptionKind, context: &str) {
    counter!(
        "exception_guard.exceptions",
        1,
        "kind" => kind.as_str(),
        "context" => context.to_string()
    );
}

/// Counts a handler that failed while handling an exception
pub fn record_handler_failure(key: &str) {
    counter!("exception_guard.handler_failures", 1, "handler" => key.to_string());
}

/// Counts a single request attempt and its outcome
pub fn record_request_attempt(outcome: &'static str) {
    counter!("exception_guard.request.attempts", 1, "outcome" => outcome);
}

/// Counts a request that had to degrade past its primary endpoint
pub fn record_request_fallback(stage: &'static str) {
    counter!("exception_guard.request.fallbacks", 1, "stage" => stage);
}
