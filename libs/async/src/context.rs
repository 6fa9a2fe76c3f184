//! Per-engine context: runner, components, services, and live jobs.
//!
//! A [`Context`] is a cheap handle. Every component and job of one engine
//! shares it, so they can reach each other without globals:
//!
//! - **Components** are lazily created singletons keyed by type
//!   ([`Context::get`]).
//! - **Services** are injected collaborators, usually trait objects, that
//!   the embedder provides up front ([`Context::provide`]).
//! - **Jobs** are owned by the context while they run and are dropped once
//!   their result completes or is abandoned ([`Context::start_job`]).

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::error::ContextError;
use crate::job::{Job, JobId, JobScope};
use crate::lock;
use crate::result::{AsyncResult, Resolver};
use crate::runner::TaskRunner;

/// A lazily created, per-context singleton.
pub trait Component: Send + Sync + 'static {
    const NAME: &'static str;

    /// Build the component. May look up services and other components.
    fn create(context: &Context) -> Self;
}

type Erased = Arc<dyn Any + Send + Sync>;

struct JobEntry {
    name: &'static str,
    /// Keeps the job alive; the scope only holds a weak reference.
    _job: Box<dyn Any + Send>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    runner: TaskRunner,
    components: Mutex<HashMap<TypeId, Erased>>,
    services: Mutex<HashMap<TypeId, Erased>>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    next_job_id: AtomicU64,
}

impl Context {
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                runner,
                components: Mutex::new(HashMap::new()),
                services: Mutex::new(HashMap::new()),
                jobs: Mutex::new(HashMap::new()),
                next_job_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.inner.runner
    }

    /// A handle that does not keep the context alive. Components that need
    /// their context later hold one of these.
    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // =========================================================================
    // Components
    // =========================================================================

    /// The context's instance of `C`, created on first use.
    ///
    /// Creation runs without the registry lock held, so `C::create` may
    /// itself call `get`. If two callers race, the first instance stored
    /// wins and both receive it.
    pub fn get<C: Component>(&self) -> Arc<C> {
        if let Some(existing) = self.lookup_component::<C>() {
            return existing;
        }

        let created: Erased = Arc::new(C::create(self));
        let stored = lock(&self.inner.components)
            .entry(TypeId::of::<C>())
            .or_insert_with(|| {
                debug!(component = C::NAME, "Created component");
                created
            })
            .clone();
        downcast_component(stored)
    }

    fn lookup_component<C: Component>(&self) -> Option<Arc<C>> {
        let components = lock(&self.inner.components);
        components
            .get(&TypeId::of::<C>())
            .cloned()
            .map(downcast_component)
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Register a service. Each type may be provided once.
    pub fn provide<T>(&self, service: Arc<T>) -> Result<(), ContextError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let mut services = lock(&self.inner.services);
        let key = TypeId::of::<Arc<T>>();
        if services.contains_key(&key) {
            return Err(ContextError::DuplicateService(type_name::<T>()));
        }
        services.insert(key, Arc::new(service));
        debug!(service = type_name::<T>(), "Provided service");
        Ok(())
    }

    /// Look up a provided service.
    pub fn service<T>(&self) -> Result<Arc<T>, ContextError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let services = lock(&self.inner.services);
        services
            .get(&TypeId::of::<Arc<T>>())
            .and_then(|erased| erased.downcast_ref::<Arc<T>>())
            .cloned()
            .ok_or(ContextError::MissingService(type_name::<T>()))
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Start a job owned by this context.
    ///
    /// The job stays alive until the result completes, or until every
    /// [`JobScope`] is dropped without completing it; the returned result is
    /// then abandoned as well. Continuations it registered through
    /// [`JobScope::continue_with`] become no-ops once it is gone.
    pub fn start_job<J: Job>(&self, job: J, input: J::Input) -> AsyncResult<J::Output> {
        let id = JobId(self.inner.next_job_id.fetch_add(1, Ordering::Relaxed));
        let job = Arc::new(Mutex::new(job));

        lock(&self.inner.jobs).insert(
            id,
            JobEntry {
                name: J::NAME,
                _job: Box::new(job.clone()),
            },
        );

        let resolver = Resolver::new(self.runner());
        let outer = Resolver::new(self.runner());
        let finished = outer.result();

        let context = self.clone();
        resolver.result().settled_on(self.runner(), move |output| {
            context.finish_job(id);
            match output {
                Some(output) => {
                    let _ = outer.complete(output);
                }
                None => warn!(job = J::NAME, job_id = %id, "Job abandoned without completing"),
            }
        });

        let scope = JobScope::new(id, Arc::downgrade(&job), resolver, self.clone());
        debug!(job = J::NAME, job_id = %id, "Starting job");
        lock(&job).start(&scope, input);

        finished
    }

    /// Number of jobs that have started and not yet completed.
    pub fn job_count(&self) -> usize {
        lock(&self.inner.jobs).len()
    }

    fn finish_job(&self, id: JobId) {
        if let Some(entry) = lock(&self.inner.jobs).remove(&id) {
            debug!(job = entry.name, job_id = %id, "Job finished");
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("runner", &self.inner.runner.name())
            .field("components", &lock(&self.inner.components).len())
            .field("services", &lock(&self.inner.services).len())
            .field("jobs", &self.job_count())
            .finish()
    }
}

/// A non-owning [`Context`] handle.
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContext")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

fn downcast_component<C: Component>(erased: Erased) -> Arc<C> {
    match erased.downcast::<C>() {
        Ok(component) => component,
        Err(_) => unreachable!("component registry is keyed by TypeId"),
    }
}
