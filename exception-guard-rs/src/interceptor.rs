//! # Interceptor
//!
//! Installs listeners on the two channels through which exceptions escape
//! normal control flow and funnels everything they capture into handler
//! dispatch:
//!
//! - **uncaught-error**: a process panic hook that stands in for the previous
//!   one until uninstalled
//! - **unhandled-rejection**: fallible tasks started with
//!   [`Interceptor::spawn_detached`] whose failure nobody observes
//!
//! It also offers wrapping combinators that turn a fallible function into one
//! that never fails, returning `None` after the failure has been dispatched.

use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;

use futures::future::{poll_fn, BoxFuture};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{self, Context};
use crate::exception_log::ExceptionLog;
use crate::registry::{DispatchOutcome, HandlerRegistry};
use crate::types::Exception;

/// The panic hook is process-wide, so installation is tracked process-wide
static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Puts back the hook that was active before [`Interceptor::install`]
static RESTORE_PREVIOUS_HOOK: Mutex<Option<Box<dyn FnOnce() + Send>>> = Mutex::new(None);

thread_local! {
    static SUPPRESSION_DEPTH: Cell<usize> = Cell::new(0);
}

/// Marks the current thread as running code whose panics are caught and
/// reported by the caller. The panic hook stays silent while any scope is
/// open.
pub(crate) struct SuppressionScope {
    // Scopes are tied to the thread that opened them
    _not_send: PhantomData<*const ()>,
}

impl SuppressionScope {
    pub(crate) fn enter() -> Self {
        SUPPRESSION_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    pub(crate) fn is_active() -> bool {
        SUPPRESSION_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for SuppressionScope {
    fn drop(&mut self) {
        SUPPRESSION_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Runs a closure, turning a panic into an exception
fn catch_sync<T, E, F>(f: F) -> Result<T, Exception>
where
    F: FnOnce() -> Result<T, E>,
    E: Into<Exception>,
{
    let _scope = SuppressionScope::enter();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(Into::into),
        Err(payload) => Err(Exception::from_panic(payload.as_ref())),
    }
}

/// Drives a future to completion, turning an error or a panic raised during
/// any poll into an exception
async fn catch_async<T, E, F>(future: F) -> Result<T, Exception>
where
    F: Future<Output = Result<T, E>>,
    E: Into<Exception>,
{
    let mut future = Box::pin(future);
    poll_fn(move |cx| -> Poll<Result<T, Exception>> {
        let _scope = SuppressionScope::enter();
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))) {
            Ok(Poll::Ready(result)) => Poll::Ready(result.map_err(Into::into)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(Exception::from_panic(payload.as_ref()))),
        }
    })
    .await
}

fn panic_context(location: Option<&Location<'_>>) -> Context {
    let mut context = Context::new(context::UNCAUGHT_ERROR);
    if let Some(location) = location {
        context = context
            .add("file", location.file())
            .add("line", location.line())
            .add("column", location.column());
    }
    if let Some(name) = std::thread::current().name() {
        context = context.add("thread", name);
    }
    context
}

/// Captures escaping exceptions and routes them to the registry and log
#[derive(Debug, Clone)]
pub struct Interceptor {
    registry: Arc<HandlerRegistry>,
    log: Arc<ExceptionLog>,
}

impl Interceptor {
    /// Creates an interceptor over the given registry and log
    pub fn new(registry: Arc<HandlerRegistry>, log: Arc<ExceptionLog>) -> Self {
        Self { registry, log }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<ExceptionLog> {
        &self.log
    }

    /// True when a panic hook from any interceptor is installed
    pub fn is_installed() -> bool {
        HOOK_INSTALLED.load(Ordering::SeqCst)
    }

    /// Installs the panic hook. Returns `false` without doing anything if a
    /// hook is already installed.
    pub fn install(&self) -> bool {
        if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
            debug!("Exception interceptor already installed");
            return false;
        }

        let registry = Arc::clone(&self.registry);
        let log = Arc::clone(&self.log);

        let previous = panic::take_hook();
        *RESTORE_PREVIOUS_HOOK
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(move || panic::set_hook(previous)));

        panic::set_hook(Box::new(move |info| {
            if SuppressionScope::is_active() {
                return;
            }

            let exception = Exception::from_panic(info.payload());
            let context = panic_context(info.location());

            // A panic raised inside the hook aborts the process, so handlers
            // run on a helper thread.
            let helper_registry = Arc::clone(&registry);
            let helper_log = Arc::clone(&log);
            let helper_exception = exception.clone();
            let helper_context = context.clone();
            let dispatched = std::thread::Builder::new()
                .name("exception-guard-hook".to_string())
                .spawn(move || {
                    helper_registry.dispatch(helper_exception, helper_context, &helper_log);
                })
                .map(|handle| handle.join().is_ok());

            if !matches!(dispatched, Ok(true)) {
                log.write(exception, context);
            }
        }));

        info!("Exception interceptor installed");
        true
    }

    /// Restores the panic hook that was active before [`Interceptor::install`].
    /// Returns `false` if nothing was installed.
    pub fn uninstall(&self) -> bool {
        if !HOOK_INSTALLED.swap(false, Ordering::SeqCst) {
            return false;
        }
        let restore = RESTORE_PREVIOUS_HOOK
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match restore {
            Some(restore) => restore(),
            None => drop(panic::take_hook()),
        }
        info!("Exception interceptor uninstalled");
        true
    }

    /// Dispatches an exception through the registry and log
    pub fn capture<E, C>(&self, exception: E, context: C) -> DispatchOutcome
    where
        E: Into<Exception>,
        C: Into<Context>,
    {
        self.registry.dispatch(exception.into(), context, &self.log)
    }

    /// Runs a fallible future on the tokio runtime. An error or panic is
    /// dispatched as an unhandled rejection and the task resolves to `None`.
    pub fn spawn_detached<F, T, E>(&self, future: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<Exception> + 'static,
    {
        let interceptor = self.clone();
        tokio::spawn(async move {
            match catch_async(future).await {
                Ok(value) => Some(value),
                Err(exception) => {
                    warn!(exception = %exception, "Detached task failed");
                    interceptor.capture(exception, context::UNHANDLED_REJECTION);
                    None
                }
            }
        })
    }

    /// Runs a closure immediately; a failure is dispatched and yields `None`
    pub fn guard_sync<T, E, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, E>,
        E: Into<Exception>,
    {
        match catch_sync(f) {
            Ok(value) => Some(value),
            Err(exception) => {
                self.capture(exception, context::WRAPPED_SYNC);
                None
            }
        }
    }

    /// Awaits a future; a failure is dispatched and yields `None`
    pub async fn guard_async<T, E, F>(&self, future: F) -> Option<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<Exception>,
    {
        match catch_async(future).await {
            Ok(value) => Some(value),
            Err(exception) => {
                self.capture(exception, context::WRAPPED_ASYNC);
                None
            }
        }
    }

    /// Wraps a fallible function of one argument into one that never fails.
    /// Tuples carry several arguments.
    pub fn wrap_sync<A, T, E, F>(&self, f: F) -> impl Fn(A) -> Option<T> + Send + Sync + 'static
    where
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
        E: Into<Exception>,
    {
        let interceptor = self.clone();
        move |arg| interceptor.guard_sync(|| f(arg))
    }

    /// Wraps an async fallible function of one argument into one whose future
    /// never fails
    pub fn wrap_async<A, T, E, F, Fut>(
        &self,
        f: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Option<T>> + Send + Sync + 'static
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<Exception> + 'static,
    {
        let interceptor = self.clone();
        move |arg| {
            let interceptor = interceptor.clone();
            let future = f(arg);
            async move { interceptor.guard_async(future).await }.boxed()
        }
    }
}
