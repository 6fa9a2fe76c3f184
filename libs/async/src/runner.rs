//! Named FIFO task sequence.
//!
//! A [`TaskRunner`] is the execution context that continuations bind to.
//! Tasks posted to a runner run one at a time, in the order they were
//! posted. While a task runs, [`TaskRunner::current`] returns its runner.
//!
//! A runner is driven either manually with [`TaskRunner::run_until_idle`]
//! (tests, embedding) or by a tokio task created with [`TaskRunner::spawn`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::lock;

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_RUNNER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<TaskRunner>> = const { RefCell::new(None) };
}

/// Handle to a task sequence. Clones refer to the same sequence.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    id: u64,
    name: String,
    queue: Mutex<VecDeque<Task>>,
    notify: Notify,
    draining: AtomicBool,
}

impl TaskRunner {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                id: NEXT_RUNNER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The runner whose task is executing on this thread, if any.
    pub fn current() -> Option<TaskRunner> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Whether a task of this runner is executing on this thread.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|runner| runner.inner.id == self.inner.id)
        })
    }

    /// Enqueue a task. Never runs it inline.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.inner.queue).push_back(Box::new(task));
        self.inner.notify.notify_one();
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Run queued tasks, including ones posted while draining, until the
    /// queue is empty. Returns the number of tasks run.
    ///
    /// Returns 0 without running anything if the runner is already being
    /// drained, either by another thread or further up this call stack.
    pub fn run_until_idle(&self) -> usize {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let _draining = DrainGuard(&self.inner.draining);

        let mut ran = 0;
        loop {
            let task = lock(&self.inner.queue).pop_front();
            let Some(task) = task else {
                break;
            };
            let _current = CurrentGuard::enter(self.clone());
            task();
            ran += 1;
        }
        ran
    }

    /// Drive this runner on a tokio task until `shutdown` flips to true.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            info!(runner = %runner.name(), "Task runner started");
            loop {
                let ran = runner.run_until_idle();
                if ran > 0 {
                    debug!(runner = %runner.name(), tasks = ran, "Drained task queue");
                }

                tokio::select! {
                    _ = runner.inner.notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            let dropped = runner.pending();
            info!(runner = %runner.name(), dropped, "Task runner stopped");
        })
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.inner.name)
            .field("pending", &self.pending())
            .finish()
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct CurrentGuard {
    previous: Option<TaskRunner>,
}

impl CurrentGuard {
    fn enter(runner: TaskRunner) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(runner)));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_run_in_post_order() {
        let runner = TaskRunner::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            runner.post(move || seen.lock().unwrap().push(i));
        }

        assert_eq!(runner.pending(), 5);
        assert_eq!(runner.run_until_idle(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(runner.pending(), 0);
    }

    #[test]
    fn test_tasks_posted_while_draining_run_after() {
        let runner = TaskRunner::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_runner = runner.clone();
        let inner_seen = seen.clone();
        runner.post(move || {
            inner_seen.lock().unwrap().push("outer");
            let nested = inner_seen.clone();
            inner_runner.post(move || nested.lock().unwrap().push("nested"));
        });
        let tail = seen.clone();
        runner.post(move || tail.lock().unwrap().push("tail"));

        assert_eq!(runner.run_until_idle(), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "tail", "nested"]);
    }

    #[test]
    fn test_current_is_set_only_while_running() {
        let runner = TaskRunner::new("main");
        assert!(TaskRunner::current().is_none());

        let observed = Arc::new(Mutex::new(None));
        let slot = observed.clone();
        let check = runner.clone();
        runner.post(move || {
            let current = TaskRunner::current().map(|r| r.name().to_string());
            *slot.lock().unwrap() = Some((current, check.is_current()));
        });
        runner.run_until_idle();

        assert_eq!(
            *observed.lock().unwrap(),
            Some((Some("main".to_string()), true))
        );
        assert!(TaskRunner::current().is_none());
        assert!(!runner.is_current());
    }

    #[test]
    fn test_reentrant_drain_is_a_no_op() {
        let runner = TaskRunner::new("test");
        let nested_ran = Arc::new(Mutex::new(None));

        let inner = runner.clone();
        let slot = nested_ran.clone();
        runner.post(move || {
            *slot.lock().unwrap() = Some(inner.run_until_idle());
        });

        assert_eq!(runner.run_until_idle(), 1);
        assert_eq!(*nested_ran.lock().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_spawned_runner_drains_and_stops() {
        let runner = TaskRunner::new("spawned");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runner.spawn(shutdown_rx);

        let (tx, rx) = tokio::sync::oneshot::channel();
        runner.post(move || {
            let _ = tx.send(TaskRunner::current().map(|r| r.name().to_string()));
        });

        assert_eq!(rx.await.unwrap(), Some("spawned".to_string()));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
