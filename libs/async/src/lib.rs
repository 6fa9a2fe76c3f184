//! # adsched-async
//!
//! Callback-style async building blocks used by the serving engine.
//!
//! ## Building Blocks
//!
//! - [`TaskRunner`]: a named FIFO task sequence; the execution context that
//!   continuations are delivered on
//! - [`AsyncResult`] / [`Resolver`]: a single-shot result whose listeners are
//!   always posted, never run inline
//! - [`AsyncDebouncer`]: coalesces concurrent requests per key and caches the
//!   last value for a bounded age
//! - [`Context`] / [`Component`] / [`Job`]: lazily created per-context
//!   singletons, injected services, and short-lived jobs that are dropped
//!   when their result completes
//! - [`Timer`]: a one-shot delay that posts onto a runner
//! - [`Clock`]: wall-clock source, swappable in tests
//!
//! ## Execution Model
//!
//! All mutable engine state lives on one runner. Work that completes
//! elsewhere (a blocking store call, a tokio timer) hands its value to a
//! [`Resolver`], and listeners are posted back to the runner they were
//! registered from.

mod clock;
mod context;
mod debouncer;
mod error;
mod job;
mod result;
mod runner;
mod timer;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use context::{Component, Context, WeakContext};
pub use debouncer::AsyncDebouncer;
pub use error::{AsyncError, ContextError};
pub use job::{Job, JobId, JobScope};
pub use result::{AsyncResult, Resolver};
pub use runner::TaskRunner;
pub use timer::Timer;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
