//! A fully wired in-memory engine for unit tests.

use std::sync::Arc;

use adsched_async::{Clock, Context, ManualClock, TaskRunner};
use adsched_testing::monday_morning;

use crate::config::EngineConfig;
use crate::rng::AdRng;
use crate::store::{MemoryStore, RecordingDelivery, StaticSegments};
use crate::{install, Services};

pub(crate) struct Engine {
    pub runner: TaskRunner,
    pub context: Context,
    pub store: Arc<MemoryStore>,
    pub delivery: Arc<RecordingDelivery>,
    pub segments: Arc<StaticSegments>,
    pub clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(ManualClock::new(monday_morning())))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let runner = TaskRunner::new("test-engine");
        let context = Context::new(runner.clone());
        let store = Arc::new(MemoryStore::with_clock(&runner, clock.clone()));
        let delivery = Arc::new(RecordingDelivery::new());
        let segments = Arc::new(StaticSegments::default());

        let services = Services::memory(
            store.clone(),
            delivery.clone(),
            segments.clone(),
            clock.clone(),
            Arc::new(AdRng::seeded(7)),
        );
        if let Err(e) = install(&context, services, config) {
            panic!("install failed: {e}");
        }

        Self {
            runner,
            context,
            store,
            delivery,
            segments,
            clock,
        }
    }
}
