//! Request coalescing with a short-lived cache.
//!
//! [`AsyncDebouncer`] runs at most one producer per key at a time. Callers
//! that arrive while a producer is in flight wait for the same value, and
//! callers that arrive within `max_age` of the last completion get the
//! cached value without running the producer at all.
//!
//! A value whose producer started before the key was invalidated is handed
//! to its waiters but never cached. An abandoned producer releases the key
//! and abandons its waiters.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::Clock;
use crate::lock;
use crate::result::{AsyncResult, Resolver};
use crate::runner::TaskRunner;

struct Entry<T: Send + 'static> {
    value: Option<T>,
    completed_at: Option<DateTime<Utc>>,
    waiters: Vec<Resolver<T>>,
    /// Bumped by `invalidate` while a producer is in flight.
    epoch: u64,
}

impl<T: Clone + Send + 'static> Entry<T> {
    fn new() -> Self {
        Self {
            value: None,
            completed_at: None,
            waiters: Vec::new(),
            epoch: 0,
        }
    }

    fn fresh_value(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> Option<&T> {
        match (&self.value, self.completed_at) {
            (Some(value), Some(at)) if !expired(at, now, max_age) => Some(value),
            _ => None,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        self.waiters.is_empty()
            && self.value.is_some()
            && self.completed_at.is_some_and(|at| expired(at, now, max_age))
    }
}

fn expired(completed_at: DateTime<Utc>, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    completed_at
        .checked_add_signed(max_age)
        .is_some_and(|expires_at| now >= expires_at)
}

type Entries<K, T> = Mutex<HashMap<K, Entry<T>>>;

/// Coalesces concurrent requests for the same key.
pub struct AsyncDebouncer<K, T: Send + 'static> {
    entries: Arc<Entries<K, T>>,
    runner: TaskRunner,
    clock: Arc<dyn Clock>,
    max_age: chrono::Duration,
}

impl<K, T> AsyncDebouncer<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    /// A debouncer whose bookkeeping runs on `runner`. A zero `max_age`
    /// coalesces in-flight requests but never serves a cached value.
    pub fn new(runner: &TaskRunner, clock: Arc<dyn Clock>, max_age: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            runner: runner.clone(),
            clock,
            max_age: chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Get the value for `key`, running `producer` only if no fresh value is
    /// cached and no producer for the key is already in flight.
    pub fn get_with_key<F>(&self, key: K, producer: F) -> AsyncResult<T>
    where
        F: FnOnce() -> AsyncResult<T>,
    {
        let resolver = Resolver::new(&self.runner);
        let result = resolver.result();

        let started_epoch = {
            let mut entries = lock(&self.entries);
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);

            if let Some(value) = entry.fresh_value(self.clock.now(), self.max_age) {
                let value = value.clone();
                drop(entries);
                let _ = resolver.complete(value);
                return result;
            }

            entry.waiters.push(resolver);
            (entry.waiters.len() == 1).then_some(entry.epoch)
        };

        if let Some(epoch) = started_epoch {
            let entries = Arc::downgrade(&self.entries);
            let clock = self.clock.clone();
            let max_age = self.max_age;
            producer().settled_on(&self.runner, move |value| {
                Self::on_result(entries, key, epoch, value, clock.now(), max_age);
            });
        }

        result
    }

    /// Drop the cached value for `key` so the next request runs the
    /// producer. An in-flight request still completes its waiters, but its
    /// value is not cached.
    pub fn invalidate(&self, key: &K) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.waiters.is_empty() {
            entries.remove(key);
            return;
        }
        entry.epoch += 1;
        entry.value = None;
        entry.completed_at = None;
    }

    /// Number of keys with a cached value or an in-flight request.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn on_result(
        entries: Weak<Entries<K, T>>,
        key: K,
        started_epoch: u64,
        value: Option<T>,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) {
        let Some(entries) = entries.upgrade() else {
            debug!("Debouncer dropped before producer completed");
            return;
        };

        let waiters = {
            let mut entries = lock(&entries);
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            let waiters = std::mem::take(&mut entry.waiters);
            match &value {
                Some(value) if entry.epoch == started_epoch => {
                    entry.value = Some(value.clone());
                    entry.completed_at = Some(now);
                }
                Some(_) => {
                    debug!("Key invalidated while producer was in flight, not caching");
                    entries.remove(&key);
                }
                None => {
                    debug!(waiters = waiters.len(), "Producer abandoned");
                    entries.remove(&key);
                }
            }

            let before = entries.len();
            entries.retain(|_, entry| !entry.is_stale(now, max_age));
            let purged = before - entries.len();
            if purged > 0 {
                debug!(purged, "Purged stale debouncer entries");
            }
            waiters
        };

        if let Some(value) = value {
            for waiter in waiters {
                let _ = waiter.complete(value.clone());
            }
        }
    }
}

impl<T: Clone + Send + 'static> AsyncDebouncer<(), T> {
    /// Keyless form of [`AsyncDebouncer::get_with_key`].
    pub fn get<F>(&self, producer: F) -> AsyncResult<T>
    where
        F: FnOnce() -> AsyncResult<T>,
    {
        self.get_with_key((), producer)
    }
}
