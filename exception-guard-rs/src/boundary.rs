//! # Component Boundary Bridge
//!
//! Connects a host UI framework's error boundary to the exception pipeline.
//! The host owns rendering and recovery; the bridge tracks the boundary
//! state, dispatches caught exceptions and schedules resets.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::{self, Context};
use crate::interceptor::Interceptor;
use crate::registry::DispatchOutcome;
use crate::types::Exception;

/// Callback notified after a caught exception has been dispatched
pub type OnError = Arc<dyn Fn(&Exception, &serde_json::Value) + Send + Sync>;

/// State exposed to the host boundary
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoundaryState {
    pub has_error: bool,
    pub error: Option<Exception>,
}

impl BoundaryState {
    /// The state a boundary enters after catching an exception
    pub fn derive_from_error(exception: Exception) -> Self {
        Self {
            has_error: true,
            error: Some(exception),
        }
    }
}

/// One error boundary of the host component tree
#[derive(Clone)]
pub struct BoundaryBridge {
    interceptor: Interceptor,
    state: Arc<RwLock<BoundaryState>>,
    on_error: Option<OnError>,
}

impl std::fmt::Debug for BoundaryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundaryBridge")
            .field("state", &self.state())
            .field("has_on_error", &self.on_error.is_some())
            .finish()
    }
}

impl BoundaryBridge {
    pub fn new(interceptor: Interceptor) -> Self {
        Self {
            interceptor,
            state: Arc::new(RwLock::new(BoundaryState::default())),
            on_error: None,
        }
    }

    /// Sets the callback invoked after each caught exception
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Exception, &serde_json::Value) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Current boundary state
    pub fn state(&self) -> BoundaryState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn has_error(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).has_error
    }

    /// Records the caught exception as the boundary state
    pub fn derive_state_from_error(&self, exception: Exception) -> BoundaryState {
        let state = BoundaryState::derive_from_error(exception);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state.clone();
        state
    }

    /// Dispatches a caught exception with the host's component info, then
    /// notifies the callback
    pub fn did_catch<E: Into<Exception>>(&self, exception: E, info: serde_json::Value) -> DispatchOutcome {
        let exception = exception.into();
        self.derive_state_from_error(exception.clone());

        let context = Context::new(context::COMPONENT_BOUNDARY).extend(info.clone());
        let outcome = self.interceptor.capture(exception.clone(), context);

        if let Some(callback) = &self.on_error {
            callback(&exception, &info);
        }
        outcome
    }

    /// Clears the error so the host renders its children again
    pub fn reset(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = BoundaryState::default();
        debug!("Component boundary reset");
    }

    /// Resets the boundary after `delay`
    pub fn schedule_reset(&self, delay: Duration) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bridge.reset();
        })
    }
}
