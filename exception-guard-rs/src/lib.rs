//! # Exception Guard
//!
//! A uniform exception-handling and resilience layer for client
//! applications. Exceptions that escape normal control flow are intercepted,
//! classified, routed to pluggable handlers and recorded in a bounded log.
//! A resilient request engine retries, resolves conflicts and degrades to
//! fallbacks, feeding its failures into the same pipeline.
//!
//! ## Features
//!
//! - Heuristic classification into a closed set of exception kinds
//! - Handler registry keyed by concrete type or kind, with isolated dispatch
//! - Bounded exception log with environment snapshots and statistics
//! - Panic hook and detached-task interception, plus never-failing wrappers
//! - Request engine with backoff, 409 resolution and fallbacks
//! - Settings from TOML files and environment variables
//!

pub mod boundary;
pub mod classifier;
pub mod context;
pub mod environment;
pub mod error;
pub mod exception_log;
pub mod interceptor;
pub mod logging;
pub mod monitoring;
pub mod registry;
pub mod request;
pub mod sanitization;
pub mod settings;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::info;

// Re-export commonly used types
pub use boundary::{BoundaryBridge, BoundaryState};
pub use classifier::classify;
pub use context::Context;
pub use environment::{EnvironmentSnapshot, NetworkClass};
pub use error::{GuardError, Result};
pub use exception_log::{ExceptionLog, ExceptionRecord, LogConfig, LogStats};
pub use interceptor::Interceptor;
pub use logging::{init_logging, LoggingConfig};
pub use registry::{DispatchOutcome, HandlerKey, HandlerRegistry};
pub use request::{
    ConflictResolution, Method, RequestEngine, RequestOptions, ReqwestTransport, SafeFetchResult, Transport,
};
pub use settings::{GuardSettings, LogLevel, ProtectionLevel, SettingsPatch, SettingsStore};
pub use types::{names, Exception, ExceptionKind, Severity};

/// Registry, log, interceptor and request engine wired together from one set
/// of settings
#[derive(Debug)]
pub struct ExceptionGuard {
    settings: SettingsStore,
    registry: Arc<HandlerRegistry>,
    log: Arc<ExceptionLog>,
    interceptor: Interceptor,
    engine: RequestEngine,
}

impl ExceptionGuard {
    /// Builds a guard using the reqwest transport
    pub fn new(settings: GuardSettings) -> Result<Self> {
        Ok(Self::with_transport(settings, Arc::new(ReqwestTransport::new()?)))
    }

    /// Builds a guard over an explicit transport
    pub fn with_transport(settings: GuardSettings, transport: Arc<dyn Transport>) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let log = Arc::new(ExceptionLog::new(LogConfig {
            log_level: settings.log_level,
            ..LogConfig::default()
        }));
        let interceptor = Interceptor::new(Arc::clone(&registry), Arc::clone(&log));
        let engine = RequestEngine::new(transport, Arc::clone(&registry), Arc::clone(&log));

        Self {
            settings: SettingsStore::new(settings),
            registry,
            log,
            interceptor,
            engine,
        }
    }

    /// Loads settings from an optional TOML file and the environment
    pub fn from_config_file(path: Option<&Path>) -> Result<Self> {
        Self::new(GuardSettings::load(path)?)
    }

    /// Installs the interception listeners unless protection is `none`.
    /// Returns whether listeners were installed by this call.
    pub fn start(&self) -> bool {
        let settings = self.settings.get();
        if settings.protection_level == ProtectionLevel::None {
            info!("Protection level is none; interception disabled");
            return false;
        }
        self.interceptor.install()
    }

    /// Removes the interception listeners
    pub fn shutdown(&self) -> bool {
        self.interceptor.uninstall()
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<ExceptionLog> {
        &self.log
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// Current settings
    pub fn settings(&self) -> GuardSettings {
        self.settings.get()
    }

    /// Merges a settings patch; the log level takes effect immediately
    pub fn update_settings(&self, patch: &SettingsPatch) -> GuardSettings {
        let settings = self.settings.update(patch);
        self.log.set_log_level(settings.log_level);
        settings
    }

    /// Restores the default settings
    pub fn reset_settings(&self) -> GuardSettings {
        let settings = self.settings.reset();
        self.log.set_log_level(settings.log_level);
        settings
    }

    /// A request engine seeded with the current settings
    pub fn engine(&self) -> RequestEngine {
        self.engine.clone().with_settings(self.settings.get())
    }

    /// Runs a request through the resilient engine
    pub async fn request<T>(&self, url: &str, options: RequestOptions<T>) -> SafeFetchResult<T>
    where
        T: DeserializeOwned + Send,
    {
        self.engine.request(url, options).await
    }

    /// Request options seeded with the current settings
    pub fn request_options<T>(&self) -> RequestOptions<T> {
        RequestOptions::from_settings(&self.settings.get())
    }

    /// Dispatches an exception captured by the caller
    pub fn capture<E, C>(&self, exception: E, context: C) -> DispatchOutcome
    where
        E: Into<Exception>,
        C: Into<Context>,
    {
        self.interceptor.capture(exception, context)
    }

    /// A new component boundary bridge feeding this guard
    pub fn boundary(&self) -> BoundaryBridge {
        BoundaryBridge::new(self.interceptor.clone())
    }
}

/// Initializes logging and starts a guard with settings from the environment
pub fn init() -> Result<ExceptionGuard> {
    let settings = GuardSettings::load(None)?;
    init_logging(Some(LoggingConfig::for_log_level(settings.log_level)))?;
    let guard = ExceptionGuard::new(settings)?;
    guard.start();
    Ok(guard)
}

/// Initializes logging and starts a guard from an explicit configuration
pub fn init_with_config(config: config::Config) -> Result<ExceptionGuard> {
    let logging_config: Option<LoggingConfig> = config.get("logging").ok();
    let settings = GuardSettings::try_from(config)?;

    init_logging(Some(
        logging_config.unwrap_or_else(|| LoggingConfig::for_log_level(settings.log_level)),
    ))?;
    let guard = ExceptionGuard::new(settings)?;
    guard.start();
    Ok(guard)
}
