//! Single-shot async results.
//!
//! A [`Resolver`] completes an [`AsyncResult`] exactly once. Listeners
//! registered with [`AsyncResult::then`] are posted to a [`TaskRunner`]
//! when the value arrives, or immediately if it already has. They are
//! never invoked inline, so a caller can register a listener while holding
//! state that the listener will also touch.
//!
//! Dropping every [`Resolver`] clone without completing abandons the
//! result. Value listeners are dropped; listeners registered with
//! [`AsyncResult::settled_on`] are posted `None` so owners can clean up.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::AsyncError;
use crate::lock;
use crate::runner::TaskRunner;

type Callback<T> = Box<dyn FnOnce(T) + Send + 'static>;

enum OnSettle<T> {
    Value(Callback<T>),
    Settled(Callback<Option<T>>),
}

struct Listener<T> {
    runner: TaskRunner,
    callback: OnSettle<T>,
}

impl<T: Send + 'static> Listener<T> {
    fn dispatch(self, value: T) {
        match self.callback {
            OnSettle::Value(callback) => self.runner.post(move || callback(value)),
            OnSettle::Settled(callback) => self.runner.post(move || callback(Some(value))),
        }
    }

    fn abandon(self) {
        if let OnSettle::Settled(callback) = self.callback {
            self.runner.post(move || callback(None));
        }
    }
}

enum State<T> {
    Pending(Vec<Listener<T>>),
    Complete(T),
    Abandoned,
}

/// The consumer side of a single-shot value.
pub struct AsyncResult<T> {
    state: Arc<Mutex<State<T>>>,
    runner: TaskRunner,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            runner: self.runner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> AsyncResult<T> {
    /// A result that is already complete.
    pub fn ready(runner: &TaskRunner, value: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Complete(value))),
            runner: runner.clone(),
        }
    }

    /// The runner listeners fall back to when registered off-runner.
    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn is_complete(&self) -> bool {
        matches!(*lock(&self.state), State::Complete(_))
    }

    /// The value, if the result has completed.
    pub fn peek(&self) -> Option<T> {
        match &*lock(&self.state) {
            State::Complete(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Register a listener on the calling runner, or on this result's runner
    /// when called from outside any runner.
    pub fn then<F>(&self, callback: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let runner = self.target_runner();
        self.then_on(&runner, callback);
    }

    /// Register a listener that is posted to `runner`.
    ///
    /// Listeners fire in registration order. A listener registered on an
    /// abandoned result is dropped without being called.
    pub fn then_on<F>(&self, runner: &TaskRunner, callback: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.register(runner, OnSettle::Value(Box::new(callback)));
    }

    /// Register a listener that is posted to `runner` with `Some(value)` on
    /// completion, or with `None` if the result is abandoned.
    pub fn settled_on<F>(&self, runner: &TaskRunner, callback: F)
    where
        F: FnOnce(Option<T>) + Send + 'static,
    {
        self.register(runner, OnSettle::Settled(Box::new(callback)));
    }

    fn register(&self, runner: &TaskRunner, callback: OnSettle<T>) {
        let listener = Listener {
            runner: runner.clone(),
            callback,
        };

        let mut state = lock(&self.state);
        match &mut *state {
            State::Pending(listeners) => listeners.push(listener),
            State::Complete(value) => {
                let value = value.clone();
                drop(state);
                listener.dispatch(value);
            }
            State::Abandoned => {
                drop(state);
                debug!(runner = %runner.name(), "Listener registered on abandoned result");
                listener.abandon();
            }
        }
    }

    /// A result completed with `f` applied to this one's value.
    pub fn map<U, F>(&self, f: F) -> AsyncResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let runner = self.target_runner();
        let resolver = Resolver::new(&runner);
        let mapped = resolver.result();
        self.then_on(&runner, move |value| {
            let _ = resolver.complete(f(value));
        });
        mapped
    }

    /// A result that completes with this one's value, or with `fallback`
    /// if `timeout` elapses first. Must be called within a tokio runtime.
    pub fn with_timeout(&self, timeout: Duration, fallback: T) -> AsyncResult<T> {
        let runner = self.target_runner();
        let resolver = Resolver::new(&runner);
        let bounded = resolver.result();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let on_value = resolver.clone();
        self.then_on(&runner, move |value| {
            let _ = cancel_tx.send(());
            let _ = on_value.try_complete(value);
        });

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if resolver.try_complete(fallback) {
                        warn!(timeout_ms = timeout.as_millis() as u64, "Result timed out, using fallback");
                    }
                }
                _ = cancel_rx => {}
            }
        });

        bounded
    }

    fn target_runner(&self) -> TaskRunner {
        TaskRunner::current().unwrap_or_else(|| self.runner.clone())
    }
}

impl<T: Clone + Send + 'static> IntoFuture for AsyncResult<T> {
    type Output = Result<T, AsyncError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    /// Await the value. A pending result delivers through its own runner,
    /// so that runner must be driven for the future to resolve.
    fn into_future(self) -> Self::IntoFuture {
        if let Some(value) = self.peek() {
            return Box::pin(async move { Ok(value) });
        }
        let (tx, rx) = oneshot::channel();
        let runner = self.runner.clone();
        self.then_on(&runner, move |value| {
            let _ = tx.send(value);
        });
        Box::pin(async move { rx.await.map_err(|_| AsyncError::Abandoned) })
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.state) {
            State::Pending(listeners) => format!("pending({} listeners)", listeners.len()),
            State::Complete(_) => "complete".to_string(),
            State::Abandoned => "abandoned".to_string(),
        };
        f.debug_struct("AsyncResult")
            .field("state", &state)
            .field("runner", &self.runner.name())
            .finish()
    }
}

/// The producer side of a single-shot value. Clones share the result.
///
/// Dropping every clone without completing abandons the result: pending
/// listeners are dropped and awaiting futures fail with
/// [`AsyncError::Abandoned`].
pub struct Resolver<T: Send + 'static> {
    inner: Arc<ResolverInner<T>>,
}

struct ResolverInner<T: Send + 'static> {
    result: AsyncResult<T>,
}

impl<T: Send + 'static> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// A pending result whose off-runner listeners go to `runner`.
    pub fn new(runner: &TaskRunner) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                result: AsyncResult {
                    state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
                    runner: runner.clone(),
                },
            }),
        }
    }

    pub fn result(&self) -> AsyncResult<T> {
        self.inner.result.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.result.is_complete()
    }

    /// Complete the result and post every pending listener.
    ///
    /// Completing twice is a programming error: the second value is
    /// discarded and [`AsyncError::AlreadyCompleted`] is returned.
    pub fn complete(&self, value: T) -> Result<(), AsyncError> {
        if self.try_complete(value) {
            Ok(())
        } else {
            warn!(
                runner = %self.inner.result.runner.name(),
                "Ignoring second completion of async result"
            );
            Err(AsyncError::AlreadyCompleted)
        }
    }

    fn try_complete(&self, value: T) -> bool {
        let listeners = {
            let mut state = lock(&self.inner.result.state);
            match &mut *state {
                State::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = State::Complete(value.clone());
                    listeners
                }
                State::Complete(_) | State::Abandoned => return false,
            }
        };

        for listener in listeners {
            listener.dispatch(value.clone());
        }
        true
    }
}

impl<T: Send + 'static> Drop for ResolverInner<T> {
    fn drop(&mut self) {
        let dropped = {
            let mut state = lock(&self.result.state);
            match &*state {
                State::Pending(_) => std::mem::replace(&mut *state, State::Abandoned),
                _ => return,
            }
        };
        if let State::Pending(listeners) = dropped {
            debug!(
                runner = %self.result.runner.name(),
                listeners = listeners.len(),
                "Async result abandoned"
            );
            for listener in listeners {
                listener.abandon();
            }
        }
    }
}
