//! # Resilient Request Engine
//!
//! Executes an HTTP request through a staged degradation pipeline: timeout,
//! retry with exponential backoff, 409 conflict resolution, a fallback
//! endpoint and finally static fallback data. The engine never fails; every
//! failure along the way is dispatched into the exception pipeline and the
//! caller receives a [`SafeFetchResult`].

pub mod conflict;
pub mod engine;
pub mod transport;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::settings::GuardSettings;
use crate::types::Exception;

pub use conflict::ConflictResolution;
pub use engine::{backoff_delay, Event, Plan, RequestEngine, Stage};
pub use transport::{Method, ReqwestTransport, Transport, TransportFailure, TransportRequest, TransportResponse};

/// Default number of retries after the first attempt
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default base delay for exponential backoff
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Options for a single engine request
#[derive(Debug, Clone)]
pub struct RequestOptions<T> {
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    /// Client body, sent as JSON
    pub body: Option<serde_json::Value>,
    /// Retries after the first attempt; `retry_count + 1` attempts in total
    pub retry_count: u32,
    /// Base delay of the exponential backoff
    pub retry_delay: Duration,
    /// Deadline of each attempt
    pub timeout: Duration,
    /// Returned alongside the error once every attempt has failed
    pub fallback_data: Option<T>,
    /// Tried once after the primary attempts are exhausted
    pub fallback_url: Option<String>,
    pub conflict_resolution: ConflictResolution,
}

impl<T> Default for RequestOptions<T> {
    fn default() -> Self {
        Self {
            method: Method::Get,
            headers: BTreeMap::new(),
            body: None,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_TIMEOUT,
            fallback_data: None,
            fallback_url: None,
            conflict_resolution: ConflictResolution::default(),
        }
    }
}

impl<T> RequestOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds retry count, retry delay and timeout from the settings
    pub fn from_settings(settings: &GuardSettings) -> Self {
        Self {
            retry_count: settings.max_retry_count,
            retry_delay: settings.initial_retry_delay(),
            timeout: settings.request_timeout(),
            ..Self::default()
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fallback_data(mut self, data: T) -> Self {
        self.fallback_data = Some(data);
        self
    }

    pub fn fallback_url<S: Into<String>>(mut self, url: S) -> Self {
        self.fallback_url = Some(url.into());
        self
    }

    pub fn conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    /// Loggable view of the options; headers and body are left out
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "method": self.method.as_str(),
            "retry_count": self.retry_count,
            "retry_delay_ms": self.retry_delay.as_millis() as u64,
            "timeout_ms": self.timeout.as_millis() as u64,
            "has_body": self.body.is_some(),
            "has_fallback_data": self.fallback_data.is_some(),
            "fallback_url": self.fallback_url,
            "conflict_resolution": self.conflict_resolution.as_str(),
        })
    }
}

/// Final result of an engine request
///
/// With fallback data both `data` and `error` are set: the caller gets a
/// usable payload and the failure that made it necessary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafeFetchResult<T> {
    pub data: Option<T>,
    pub error: Option<Exception>,
    pub status: Option<u16>,
    pub headers: Option<BTreeMap<String, String>>,
}

impl<T> SafeFetchResult<T> {
    /// True when data arrived without any error
    pub fn is_ok(&self) -> bool {
        self.data.is_some() && self.error.is_none()
    }

    /// True when fallback data masks a failure
    pub fn is_degraded(&self) -> bool {
        self.data.is_some() && self.error.is_some()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }
}
