//! Shared harness for ad server integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use adsched_async::{Clock, Context, TaskRunner};
use adsched_server::store::{MemoryStore, RecordingDelivery, StaticSegments};
use adsched_server::{install, AdRng, EngineConfig, Services};

pub struct Harness {
    pub runner: TaskRunner,
    pub context: Context,
    pub store: Arc<MemoryStore>,
    pub delivery: Arc<RecordingDelivery>,
    pub segments: Arc<StaticSegments>,
    pub clock: Arc<dyn Clock>,
}

impl Harness {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        adsched_testing::init_tracing();

        let runner = TaskRunner::new("integration");
        let context = Context::new(runner.clone());
        let store = Arc::new(MemoryStore::with_clock(&runner, clock.clone()));
        let delivery = Arc::new(RecordingDelivery::new());
        let segments = Arc::new(StaticSegments::default());

        let services = Services::memory(
            store.clone(),
            delivery.clone(),
            segments.clone(),
            clock.clone(),
            Arc::new(AdRng::seeded(11)),
        );
        install(&context, services, config).expect("install services");

        Self {
            runner,
            context,
            store,
            delivery,
            segments,
            clock,
        }
    }

    /// Run every queued task and return the completed value.
    pub fn drain<T: Clone + Send + 'static>(&self, result: adsched_async::AsyncResult<T>) -> T {
        self.runner.run_until_idle();
        result.peek().expect("result completed")
    }
}
