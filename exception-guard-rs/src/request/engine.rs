//! Staged request execution.
//!
//! The degradation pipeline is an explicit state machine. [`Stage::next`] is
//! a pure transition function; [`RequestEngine`] performs the side effects
//! of each stage and feeds the resulting [`Event`] back into it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use super::conflict::{self, ConflictResolution, Winner};
use super::transport::{Transport, TransportFailure, TransportRequest, TransportResponse};
use super::{RequestOptions, SafeFetchResult};
use crate::context::{self, Context};
use crate::exception_log::ExceptionLog;
use crate::monitoring;
use crate::registry::HandlerRegistry;
use crate::settings::GuardSettings;
use crate::types::{names, Exception};

/// The parts of the options that shape the stage graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub retry_count: u32,
    pub has_fallback_url: bool,
    pub has_fallback_data: bool,
}

impl Plan {
    pub fn of<T>(options: &RequestOptions<T>) -> Self {
        Self {
            retry_count: options.retry_count,
            has_fallback_url: options.fallback_url.is_some(),
            has_fallback_data: options.fallback_data.is_some(),
        }
    }

    fn after_primary(&self) -> Stage {
        if self.has_fallback_url {
            Stage::FallbackUrl
        } else {
            self.after_fallback_url()
        }
    }

    fn after_fallback_url(&self) -> Stage {
        if self.has_fallback_data {
            Stage::FallbackData
        } else {
            Stage::Failed
        }
    }
}

/// Stage of a request; attempt indices are 0-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Attempting(u32),
    /// Backing off after the failed attempt
    Retrying(u32),
    /// Resolving the 409 returned by the attempt
    ConflictCheck(u32),
    FallbackUrl,
    FallbackData,
    Failed,
    Done,
}

/// What happened in a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Succeeded,
    Conflict,
    RetryableFailure,
    TerminalFailure,
    Resolved,
    Unresolved,
    BackoffElapsed,
}

impl Stage {
    /// True for stages that produce the final result
    pub fn is_final(self) -> bool {
        matches!(self, Stage::FallbackData | Stage::Failed | Stage::Done)
    }

    /// Transition function of the pipeline. Events that do not apply to a
    /// stage leave it unchanged.
    pub fn next(self, event: Event, plan: &Plan) -> Stage {
        match (self, event) {
            (Stage::Attempting(_), Event::Succeeded)
            | (Stage::ConflictCheck(_), Event::Resolved)
            | (Stage::FallbackUrl, Event::Succeeded) => Stage::Done,
            (Stage::Attempting(attempt), Event::Conflict) => Stage::ConflictCheck(attempt),
            (Stage::Attempting(attempt), Event::RetryableFailure)
            | (Stage::ConflictCheck(attempt), Event::Unresolved) => {
                if attempt < plan.retry_count {
                    Stage::Retrying(attempt)
                } else {
                    plan.after_primary()
                }
            }
            (Stage::Attempting(_), Event::TerminalFailure) => plan.after_primary(),
            (Stage::Retrying(attempt), Event::BackoffElapsed) => Stage::Attempting(attempt + 1),
            (Stage::FallbackUrl, Event::Conflict | Event::RetryableFailure | Event::TerminalFailure) => {
                plan.after_fallback_url()
            }
            (stage, _) => stage,
        }
    }
}

/// Delay before the retry that follows attempt `attempt`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let nanos = 1u128
        .checked_shl(attempt)
        .and_then(|factor| base.as_nanos().checked_mul(factor));
    match nanos {
        Some(nanos) => u64::try_from(nanos / 1_000_000_000)
            .map(|secs| Duration::new(secs, (nanos % 1_000_000_000) as u32))
            .unwrap_or(Duration::MAX),
        None => Duration::MAX,
    }
}

/// Error, status and headers of the most recent primary failure
#[derive(Debug, Default)]
struct LastFailure {
    error: Option<Exception>,
    status: Option<u16>,
    headers: Option<BTreeMap<String, String>>,
}

impl LastFailure {
    fn into_result<T>(self, data: Option<T>) -> SafeFetchResult<T> {
        SafeFetchResult {
            data,
            error: self.error,
            status: self.status,
            headers: self.headers,
        }
    }
}

fn http_failure(response: &TransportResponse) -> Exception {
    Exception::new(
        names::HTTP_ERROR,
        format!("HTTP error: status {}", response.status),
    )
    .with_status(response.status)
}

fn decode<T: DeserializeOwned>(
    body: serde_json::Value,
    status: u16,
    headers: BTreeMap<String, String>,
) -> Result<SafeFetchResult<T>, Exception> {
    let data = serde_json::from_value(body)?;
    Ok(SafeFetchResult {
        data: Some(data),
        error: None,
        status: Some(status),
        headers: Some(headers),
    })
}

/// Executes requests through the degradation pipeline
#[derive(Clone)]
pub struct RequestEngine {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    log: Arc<ExceptionLog>,
    settings: GuardSettings,
}

impl fmt::Debug for RequestEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RequestEngine {
    /// Creates an engine that dispatches its failures into the given
    /// registry and log
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<HandlerRegistry>, log: Arc<ExceptionLog>) -> Self {
        Self {
            transport,
            registry,
            log,
            settings: GuardSettings::default(),
        }
    }

    /// Seeds request defaults from the settings
    pub fn with_settings(mut self, settings: GuardSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Options seeded from this engine's settings
    pub fn options<T>(&self) -> RequestOptions<T> {
        RequestOptions::from_settings(&self.settings)
    }

    /// GET with the engine's default options
    pub async fn get<T>(&self, url: &str) -> SafeFetchResult<T>
    where
        T: DeserializeOwned + Send,
    {
        self.request(url, self.options()).await
    }

    /// Runs a request to completion. Never fails: failures are dispatched and
    /// summarized in the result.
    pub async fn request<T>(&self, url: &str, options: RequestOptions<T>) -> SafeFetchResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "safe_fetch",
            %request_id,
            url = %url,
            method = %options.method,
        );
        self.run(url, options).instrument(span).await
    }

    async fn run<T>(&self, url: &str, mut options: RequestOptions<T>) -> SafeFetchResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let plan = Plan::of(&options);
        let mut stage = Stage::Attempting(0);
        let mut last = LastFailure::default();
        let mut conflict: Option<TransportResponse> = None;
        let mut resolved: Option<SafeFetchResult<T>> = None;

        loop {
            stage = match stage {
                Stage::Attempting(attempt) => {
                    let (event, outcome) = match self.send(url, &options, options.body.clone()).await {
                        Ok(response) if response.is_success() => {
                            let headers = response.headers.clone();
                            match decode(response.body, response.status, response.headers) {
                                Ok(result) => {
                                    resolved = Some(result);
                                    (Event::Succeeded, "success")
                                }
                                Err(exception) => {
                                    self.report(context::SAFE_FETCH, url, attempt, &options, exception.clone());
                                    last = LastFailure {
                                        error: Some(exception),
                                        status: Some(response.status),
                                        headers: Some(headers),
                                    };
                                    (Event::RetryableFailure, "decode_error")
                                }
                            }
                        }
                        Ok(response) if response.is_conflict() => {
                            conflict = Some(response);
                            (Event::Conflict, "conflict")
                        }
                        Ok(response) => {
                            let exception = http_failure(&response);
                            self.report(context::SAFE_FETCH, url, attempt, &options, exception.clone());
                            last = LastFailure {
                                error: Some(exception),
                                status: Some(response.status),
                                headers: Some(response.headers),
                            };
                            (Event::RetryableFailure, "http_error")
                        }
                        Err(failure) => {
                            let (event, outcome) = if failure.is_terminal() {
                                (Event::TerminalFailure, "terminal")
                            } else {
                                (Event::RetryableFailure, "transport_error")
                            };
                            let exception = failure.into_exception();
                            self.report(context::SAFE_FETCH, url, attempt, &options, exception.clone());
                            last = LastFailure {
                                error: Some(exception),
                                ..LastFailure::default()
                            };
                            (event, outcome)
                        }
                    };
                    monitoring::record_request_attempt(outcome);
                    debug!(attempt, outcome, "Request attempt finished");
                    stage.next(event, &plan)
                }

                Stage::ConflictCheck(attempt) => {
                    let event = match conflict.take() {
                        Some(response) => match self.resolve_conflict(url, &options, &response).await {
                            Some((body, headers)) => match decode(body, 200, headers) {
                                Ok(result) => {
                                    debug!(strategy = %options.conflict_resolution, "Conflict resolved");
                                    resolved = Some(result);
                                    Event::Resolved
                                }
                                Err(exception) => {
                                    self.report(context::SAFE_FETCH, url, attempt, &options, exception.clone());
                                    last = LastFailure {
                                        error: Some(exception),
                                        status: Some(response.status),
                                        headers: Some(response.headers),
                                    };
                                    Event::Unresolved
                                }
                            },
                            None => {
                                let exception = http_failure(&response);
                                self.report(context::SAFE_FETCH, url, attempt, &options, exception.clone());
                                last = LastFailure {
                                    error: Some(exception),
                                    status: Some(response.status),
                                    headers: Some(response.headers),
                                };
                                Event::Unresolved
                            }
                        },
                        None => Event::Unresolved,
                    };
                    stage.next(event, &plan)
                }

                Stage::Retrying(attempt) => {
                    let delay = backoff_delay(options.retry_delay, attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                    tokio::time::sleep(delay).await;
                    stage.next(Event::BackoffElapsed, &plan)
                }

                Stage::FallbackUrl => {
                    monitoring::record_request_fallback("fallback_url");
                    let event = match options.fallback_url.clone() {
                        Some(fallback_url) => self.try_fallback_url(&fallback_url, &options, &mut resolved).await,
                        None => Event::TerminalFailure,
                    };
                    stage.next(event, &plan)
                }

                Stage::FallbackData => {
                    monitoring::record_request_fallback("fallback_data");
                    warn!(error = ?last.error.as_ref().map(|e| e.to_string()), "Serving fallback data");
                    return last.into_result(options.fallback_data.take());
                }

                Stage::Failed => {
                    warn!(error = ?last.error.as_ref().map(|e| e.to_string()), "Request failed");
                    return last.into_result(None);
                }

                Stage::Done => match resolved.take() {
                    Some(result) => return result,
                    None => Stage::Failed,
                },
            };
        }
    }

    /// One attempt against the fallback endpoint. Its failure is reported
    /// separately and leaves the primary failure in place.
    async fn try_fallback_url<T>(
        &self,
        fallback_url: &str,
        options: &RequestOptions<T>,
        resolved: &mut Option<SafeFetchResult<T>>,
    ) -> Event
    where
        T: DeserializeOwned + Send,
    {
        let exception = match self.send(fallback_url, options, options.body.clone()).await {
            Ok(response) if response.is_success() => {
                match decode(response.body, response.status, response.headers) {
                    Ok(result) => {
                        debug!(url = %fallback_url, "Fallback endpoint succeeded");
                        *resolved = Some(result);
                        return Event::Succeeded;
                    }
                    Err(exception) => exception,
                }
            }
            Ok(response) => http_failure(&response),
            Err(failure) => failure.into_exception(),
        };

        let context = Context::new(context::SAFE_FETCH_FALLBACK)
            .add("url", fallback_url)
            .add("options", options.summary());
        self.registry.dispatch(exception, context, &self.log);
        Event::RetryableFailure
    }

    async fn resolve_conflict<T>(
        &self,
        url: &str,
        options: &RequestOptions<T>,
        server: &TransportResponse,
    ) -> Option<(serde_json::Value, BTreeMap<String, String>)>
    where
        T: Send,
    {
        match options.conflict_resolution {
            ConflictResolution::ServerWins => Some((server.body.clone(), server.headers.clone())),
            ConflictResolution::Timestamp => match conflict::newer(&server.body, options.body.as_ref()) {
                Winner::Client => options.body.clone().map(|body| (body, server.headers.clone())),
                Winner::Server => Some((server.body.clone(), server.headers.clone())),
            },
            ConflictResolution::ClientWins => match self.send(url, options, options.body.clone()).await {
                Ok(response) if response.is_success() => Some((response.body, response.headers)),
                Ok(response) => {
                    debug!(status = response.status, "Client-wins re-issue rejected");
                    None
                }
                Err(failure) => {
                    debug!(failure = %failure.exception(), "Client-wins re-issue failed");
                    None
                }
            },
        }
    }

    async fn send<T>(
        &self,
        url: &str,
        options: &RequestOptions<T>,
        body: Option<serde_json::Value>,
    ) -> Result<TransportResponse, TransportFailure> {
        let request = TransportRequest {
            method: options.method,
            url: url.to_string(),
            headers: options.headers.clone(),
            body,
            timeout: options.timeout,
        };

        // Dropping the transport future cancels the in-flight request
        match tokio::time::timeout(options.timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportFailure::Retryable(Exception::new(
                names::ABORT_ERROR,
                format!("request timeout after {}ms", options.timeout.as_millis()),
            ))),
        }
    }

    fn report<T>(&self, label: &str, url: &str, attempt: u32, options: &RequestOptions<T>, exception: Exception) {
        let context = Context::new(label)
            .add("url", url)
            .add("attempt", attempt)
            .add("options", options.summary());
        self.registry.dispatch(exception, context, &self.log);
    }
}
