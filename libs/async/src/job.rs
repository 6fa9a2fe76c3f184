//! Short-lived units of work owned by a [`Context`].
//!
//! A job chains async steps. Each step registers a continuation built with
//! [`JobScope::continue_with`], which re-enters the job with exclusive
//! access. The job ends when it calls [`JobScope::complete`]; the context
//! then drops it, and any continuation still in flight finds it gone and
//! does nothing.

use std::fmt;
use std::sync::{Mutex, Weak};

use tracing::{debug, warn};

use crate::context::Context;
use crate::lock;
use crate::result::Resolver;

/// Identifier of a running job, unique within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// A unit of work started with [`Context::start_job`].
pub trait Job: Send + Sized + 'static {
    type Input: Send + 'static;
    type Output: Clone + Send + 'static;

    const NAME: &'static str;

    /// Begin the work. Must eventually call `scope.complete`, either here
    /// or from a continuation.
    fn start(&mut self, scope: &JobScope<Self>, input: Self::Input);
}

/// A running job's handle on its context and its result.
pub struct JobScope<J: Job> {
    id: JobId,
    job: Weak<Mutex<J>>,
    resolver: Resolver<J::Output>,
    context: Context,
}

impl<J: Job> Clone for JobScope<J> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            job: self.job.clone(),
            resolver: self.resolver.clone(),
            context: self.context.clone(),
        }
    }
}

impl<J: Job> JobScope<J> {
    pub(crate) fn new(
        id: JobId,
        job: Weak<Mutex<J>>,
        resolver: Resolver<J::Output>,
        context: Context,
    ) -> Self {
        Self {
            id,
            job,
            resolver,
            context,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_complete(&self) -> bool {
        self.resolver.is_complete()
    }

    /// Finish the job with `output`. Later calls are ignored.
    pub fn complete(&self, output: J::Output) {
        if self.resolver.complete(output).is_err() {
            warn!(job = J::NAME, job_id = %self.id, "Job completed more than once");
        }
    }

    /// Wrap a job method as a result listener. The listener calls `step`
    /// with the job locked, or does nothing if the job has been dropped.
    pub fn continue_with<A, F>(&self, step: F) -> impl FnOnce(A) + Send + 'static
    where
        A: Send + 'static,
        F: FnOnce(&mut J, &JobScope<J>, A) + Send + 'static,
    {
        let scope = self.clone();
        move |arg| {
            let Some(job) = scope.job.upgrade() else {
                debug!(job = J::NAME, job_id = %scope.id, "Job gone, dropping continuation");
                return;
            };
            if scope.is_complete() {
                debug!(job = J::NAME, job_id = %scope.id, "Job already complete, dropping continuation");
                return;
            }
            let mut guard = lock(&job);
            step(&mut *guard, &scope, arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::AsyncResult;
    use crate::runner::TaskRunner;

    /// Adds two numbers, fetching the second one asynchronously.
    #[derive(Default)]
    struct AddJob {
        first: i64,
    }

    impl AddJob {
        fn on_second(&mut self, scope: &JobScope<Self>, second: i64) {
            scope.complete(self.first + second);
        }
    }

    struct AddInput {
        first: i64,
        second: AsyncResult<i64>,
    }

    impl Job for AddJob {
        type Input = AddInput;
        type Output = i64;
        const NAME: &'static str = "add";

        fn start(&mut self, scope: &JobScope<Self>, input: AddInput) {
            self.first = input.first;
            input.second.then(scope.continue_with(Self::on_second));
        }
    }

    #[test]
    fn test_job_completes_and_is_removed() {
        let runner = TaskRunner::new("jobs");
        let context = Context::new(runner.clone());
        let second = Resolver::new(&runner);

        let result = context.start_job(
            AddJob::default(),
            AddInput {
                first: 2,
                second: second.result(),
            },
        );
        assert_eq!(context.job_count(), 1);

        second.complete(40).unwrap();
        runner.run_until_idle();

        assert_eq!(result.peek(), Some(42));
        assert_eq!(context.job_count(), 0);
    }

    struct ImmediateJob;

    impl Job for ImmediateJob {
        type Input = ();
        type Output = &'static str;
        const NAME: &'static str = "immediate";

        fn start(&mut self, scope: &JobScope<Self>, _input: ()) {
            scope.complete("first");
            scope.complete("second");
        }
    }

    #[test]
    fn test_first_completion_wins() {
        let runner = TaskRunner::new("jobs");
        let context = Context::new(runner.clone());

        let result = context.start_job(ImmediateJob, ());
        assert!(!result.is_complete());

        runner.run_until_idle();
        assert_eq!(result.peek(), Some("first"));
        assert_eq!(context.job_count(), 0);
    }

    /// Waits on an upstream value whose producer goes away.
    struct OrphanedJob;

    impl Job for OrphanedJob {
        type Input = Resolver<u32>;
        type Output = u32;
        const NAME: &'static str = "orphaned";

        fn start(&mut self, scope: &JobScope<Self>, upstream: Resolver<u32>) {
            upstream
                .result()
                .then(scope.continue_with(|_job: &mut OrphanedJob, scope, value| {
                    scope.complete(value);
                }));
        }
    }

    #[tokio::test]
    async fn test_abandoned_job_is_removed() {
        let runner = TaskRunner::new("jobs");
        let context = Context::new(runner.clone());

        let result = context.start_job(OrphanedJob, Resolver::new(&runner));
        runner.run_until_idle();

        assert_eq!(context.job_count(), 0);
        assert!(!result.is_complete());
        assert_eq!(result.await, Err(crate::AsyncError::Abandoned));
    }

    #[test]
    fn test_continuation_after_completion_is_dropped() {
        let runner = TaskRunner::new("jobs");
        let context = Context::new(runner.clone());
        let late = Resolver::new(&runner);

        struct RaceJob {
            late: Option<AsyncResult<i64>>,
        }

        impl Job for RaceJob {
            type Input = ();
            type Output = i64;
            const NAME: &'static str = "race";

            fn start(&mut self, scope: &JobScope<Self>, _input: ()) {
                if let Some(late) = self.late.take() {
                    late.then(scope.continue_with(|_job: &mut RaceJob, scope, value| {
                        scope.complete(value);
                    }));
                }
                scope.complete(1);
            }
        }

        let result = context.start_job(
            RaceJob {
                late: Some(late.result()),
            },
            (),
        );
        runner.run_until_idle();
        assert_eq!(context.job_count(), 0);

        late.complete(99).unwrap();
        runner.run_until_idle();
        assert_eq!(result.peek(), Some(1));
    }
}
