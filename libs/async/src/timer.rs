//! One-shot timer that posts onto a runner.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::runner::TaskRunner;

/// A restartable one-shot delay.
///
/// The timer counts as running from `start` until its task begins
/// executing on the runner, so a task that was already posted but has not
/// run yet is still cancelled by `stop`.
#[derive(Debug, Default)]
pub struct Timer {
    state: Arc<TimerState>,
    sleeper: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct TimerState {
    generation: AtomicU64,
    running: AtomicBool,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending firing. Must be called within a
    /// tokio runtime.
    pub fn start<F>(&mut self, runner: &TaskRunner, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();

        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.running.store(true, Ordering::Release);

        let state = self.state.clone();
        let runner = runner.clone();
        self.sleeper = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            runner.post(move || {
                if state.generation.load(Ordering::Acquire) != generation {
                    return;
                }
                state.running.store(false, Ordering::Release);
                task();
            });
        }));
    }

    /// Cancel a pending firing. Returns whether the timer was running.
    pub fn stop(&mut self) -> bool {
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(sleeper) = self.sleeper.take() {
            sleeper.abort();
        }
        self.state.running.swap(false, Ordering::AcqRel)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
