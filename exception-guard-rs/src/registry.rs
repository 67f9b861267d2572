//! # Handler Registry
//!
//! Maps exception discriminators to handlers. A handler can be registered
//! under a concrete type key or under a classified kind; the two are
//! independent entries in one flat map, and the concrete key wins.
//!
//! Handlers run inside an isolating guard. A handler that returns an error
//! or panics produces exactly one `handler-failure` record and never
//! re-enters dispatch.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};

use crate::classifier::classify;
use crate::context::{self, Context};
use crate::exception_log::{ExceptionLog, ExceptionRecord};
use crate::interceptor::SuppressionScope;
use crate::monitoring;
use crate::types::{Exception, ExceptionKind, Severity};

/// A registered exception handler
pub type Handler = Arc<dyn Fn(&Exception, &Context) -> anyhow::Result<()> + Send + Sync>;

/// Registry key: a concrete type key or a classified kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    /// Matches `Exception::type_key`
    Type(String),
    /// Matches the classified kind
    Kind(ExceptionKind),
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKey::Type(name) => write!(f, "type:{}", name),
            HandlerKey::Kind(kind) => write!(f, "kind:{}", kind),
        }
    }
}

impl From<ExceptionKind> for HandlerKey {
    fn from(kind: ExceptionKind) -> Self {
        HandlerKey::Kind(kind)
    }
}

impl From<&str> for HandlerKey {
    fn from(type_key: &str) -> Self {
        HandlerKey::Type(type_key.to_string())
    }
}

impl From<String> for HandlerKey {
    fn from(type_key: String) -> Self {
        HandlerKey::Type(type_key)
    }
}

/// A handler and its severity tag
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Handler,
    pub severity: Severity,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

/// What happened to a dispatched exception
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// No handler matched; the exception was only logged
    Unhandled {
        record: Arc<ExceptionRecord>,
    },
    /// A handler ran successfully
    Handled {
        record: Arc<ExceptionRecord>,
        key: HandlerKey,
    },
    /// The handler failed; its failure was logged separately
    HandlerFailed {
        record: Arc<ExceptionRecord>,
        key: HandlerKey,
        failure: Arc<ExceptionRecord>,
    },
}

impl DispatchOutcome {
    /// The record written for the dispatched exception
    pub fn record(&self) -> &Arc<ExceptionRecord> {
        match self {
            DispatchOutcome::Unhandled { record }
            | DispatchOutcome::Handled { record, .. }
            | DispatchOutcome::HandlerFailed { record, .. } => record,
        }
    }

    /// True when a handler ran, successfully or not
    pub fn found_handler(&self) -> bool {
        !matches!(self, DispatchOutcome::Unhandled { .. })
    }
}

/// Flat mapping from handler keys to handlers
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<HandlerKey, HandlerEntry>>,
}

impl HandlerRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler with the default `Medium` severity
    pub fn register<K, F>(&self, key: K, handler: F)
    where
        K: Into<HandlerKey>,
        F: Fn(&Exception, &Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_with_severity(key, handler, Severity::default());
    }

    /// Registers a handler, replacing any handler under the same key
    pub fn register_with_severity<K, F>(&self, key: K, handler: F, severity: Severity)
    where
        K: Into<HandlerKey>,
        F: Fn(&Exception, &Context) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!(key = %key, severity = %severity, "Registering exception handler");
        let entry = HandlerEntry {
            handler: Arc::new(handler),
            severity,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    /// Removes the handler under the key; returns whether one existed
    pub fn unregister<K: Into<HandlerKey>>(&self, key: K) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key.into())
            .is_some()
    }

    /// The handler registered under the key
    pub fn get<K: Into<HandlerKey>>(&self, key: K) -> Option<Handler> {
        self.entry(&key.into()).map(|entry| entry.handler)
    }

    /// The severity tag registered under the key
    pub fn severity<K: Into<HandlerKey>>(&self, key: K) -> Option<Severity> {
        self.entry(&key.into()).map(|entry| entry.severity)
    }

    /// True when a handler is registered under the key
    pub fn contains<K: Into<HandlerKey>>(&self, key: K) -> bool {
        self.entry(&key.into()).is_some()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every handler
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn entry(&self, key: &HandlerKey) -> Option<HandlerEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Finds the handler for an exception: concrete type key first, then the
    /// classified kind
    pub fn resolve(&self, exception: &Exception) -> Option<(HandlerKey, HandlerEntry)> {
        let by_type = HandlerKey::Type(exception.type_key().to_string());
        if let Some(entry) = self.entry(&by_type) {
            return Some((by_type, entry));
        }
        let by_kind = HandlerKey::Kind(classify(exception));
        self.entry(&by_kind).map(|entry| (by_kind, entry))
    }

    /// Logs the exception and runs its handler, if any, in isolation
    pub fn dispatch<C: Into<Context>>(
        &self,
        exception: Exception,
        context: C,
        log: &ExceptionLog,
    ) -> DispatchOutcome {
        let context = context.into();
        let record = log.write(exception.clone(), context.clone());

        let (key, entry) = match self.resolve(&exception) {
            Some(found) => found,
            None => return DispatchOutcome::Unhandled { record },
        };

        // The entry was cloned out, so no lock is held while the handler runs.
        let result = {
            let _scope = SuppressionScope::enter();
            panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(&exception, &context)))
        };

        let failure = match result {
            Ok(Ok(())) => {
                debug!(key = %key, record_id = record.id, "Exception handled");
                return DispatchOutcome::Handled { record, key };
            }
            Ok(Err(err)) => Exception::from(err),
            Err(payload) => Exception::from_panic(payload.as_ref()),
        };

        if entry.severity >= Severity::High {
            error!(key = %key, severity = %entry.severity, failure = %failure, "High severity handler failed");
        }
        monitoring::record_handler_failure(&key.to_string());

        let failure_context = Context::new(context::HANDLER_FAILURE)
            .add("handler", key.to_string())
            .add("severity", entry.severity)
            .add("original", &exception)
            .add("context", &context.label)
            .add("extra", context.payload());
        let failure = log.write(failure, failure_context);

        DispatchOutcome::HandlerFailed {
            record,
            key,
            failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::names;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn(&Exception, &Context) -> anyhow::Result<()> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_register_get_unregister() {
        let registry = HandlerRegistry::new();
        registry.register(ExceptionKind::NetworkError, |_, _| Ok(()));
        registry.register_with_severity("ValidationError", |_, _| Ok(()), Severity::High);

        assert_eq!(registry.len(), 2);
        assert!(registry.get(ExceptionKind::NetworkError).is_some());
        assert_eq!(registry.severity(ExceptionKind::NetworkError), Some(Severity::Medium));
        assert_eq!(registry.severity("ValidationError"), Some(Severity::High));

        assert!(registry.unregister("ValidationError"));
        assert!(!registry.unregister("ValidationError"));
        assert!(registry.get("ValidationError").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_type_and_kind_keys_are_independent() {
        let registry = HandlerRegistry::new();
        registry.register("NetworkError", |_, _| Ok(()));
        registry.register(ExceptionKind::NetworkError, |_, _| Ok(()));
        assert_eq!(registry.len(), 2);

        registry.unregister("NetworkError");
        assert!(registry.contains(ExceptionKind::NetworkError));
    }

    #[test]
    fn test_kind_handler_receives_classified_exception() {
        let registry = HandlerRegistry::new();
        let log = ExceptionLog::default();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(ExceptionKind::NullReference, counting_handler(&calls));

        let outcome = registry.dispatch(
            Exception::new(names::TYPE_ERROR, "Cannot read properties of undefined"),
            "dispatch",
            &log,
        );

        assert!(matches!(outcome, DispatchOutcome::Handled { key: HandlerKey::Kind(ExceptionKind::NullReference), .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_type_handler_takes_precedence_over_kind() {
        let registry = HandlerRegistry::new();
        let log = ExceptionLog::default();
        let type_calls = Arc::new(AtomicUsize::new(0));
        let kind_calls = Arc::new(AtomicUsize::new(0));
        registry.register("QuotaError", counting_handler(&type_calls));
        registry.register(ExceptionKind::NetworkError, counting_handler(&kind_calls));

        let exception = Exception::general("network quota exceeded").with_discriminator("QuotaError");
        let outcome = registry.dispatch(exception, "dispatch", &log);

        assert!(matches!(outcome, DispatchOutcome::Handled { key: HandlerKey::Type(_), .. }));
        assert_eq!(type_calls.load(Ordering::SeqCst), 1);
        assert_eq!(kind_calls.load(Ordering::SeqCst), 0);

        registry.dispatch(Exception::general("network down"), "dispatch", &log);
        assert_eq!(kind_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unhandled_exception_is_logged() {
        let registry = HandlerRegistry::new();
        let log = ExceptionLog::default();

        let outcome = registry.dispatch(Exception::general("odd"), "dispatch", &log);

        assert!(!outcome.found_handler());
        assert_eq!(log.len(), 1);
        assert_eq!(outcome.record().exception.message, "odd");
    }

    #[test_log::test]
    fn test_failing_handler_is_isolated() {
        let registry = HandlerRegistry::new();
        let log = ExceptionLog::default();
        registry.register(ExceptionKind::General, |_, _| anyhow::bail!("handler exploded"));

        let outcome = registry.dispatch(
            Exception::general("original"),
            Context::new("dispatch").add("screen", "settings"),
            &log,
        );

        let failure = match outcome {
            DispatchOutcome::HandlerFailed { failure, .. } => failure,
            other => panic!("expected handler failure, got {:?}", other),
        };
        assert_eq!(failure.context, context::HANDLER_FAILURE);
        assert_eq!(failure.exception.message, "handler exploded");
        assert_eq!(failure.payload["original"]["message"], "original");
        assert_eq!(failure.payload["context"], "dispatch");
        assert_eq!(failure.payload["extra"]["screen"], "settings");
        assert_eq!(log.by_context(context::HANDLER_FAILURE).len(), 1);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let registry = HandlerRegistry::new();
        let log = ExceptionLog::default();
        registry.register(ExceptionKind::General, |_, _| panic!("handler panicked"));

        for _ in 0..3 {
            let outcome = registry.dispatch(Exception::general("again"), "dispatch", &log);
            assert!(matches!(outcome, DispatchOutcome::HandlerFailed { .. }));
        }

        let failures = log.by_context(context::HANDLER_FAILURE);
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[0].exception.name, names::PANIC);
        assert_eq!(failures[0].exception.message, "handler panicked");
        assert_eq!(log.stats().handler_failures, 3);
    }

    #[test]
    fn test_handler_failure_does_not_reenter_dispatch() {
        let registry = HandlerRegistry::new();
        let log = ExceptionLog::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        // The failure itself classifies as General, the same kind the handler
        // is registered for.
        registry.register(ExceptionKind::General, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("still broken")
        });

        registry.dispatch(Exception::general("first"), "dispatch", &log);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.len(), 2);
    }
}
