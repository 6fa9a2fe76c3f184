//! # adsched-server
//!
//! Ad eligibility and serving engine.
//!
//! ## Components
//!
//! - [`serving::AdServing`]: the serving scheduler; arms a timer, runs a
//!   cycle, and re-arms at a cadence bounded by the hourly cap
//! - [`eligible_ads::EligibleAdsJob`]: selects the ads that may be shown
//!   for the user's segments right now
//! - [`ad_events::AdEventHistory`] / [`ad_events::FireAdEventJob`]: the
//!   debounced ad event log and the confirmation recorder
//! - [`frequency_capping`]: permission and exclusion rules
//! - [`store`]: collaborator traits with memory and SQLite backends
//!
//! ## Wiring
//!
//! Everything hangs off an [`adsched_async::Context`]. The embedder builds
//! [`Services`], calls [`install`], then asks the context for
//! [`serving::AdServing`]:
//!
//! ```text
//! let context = Context::new(TaskRunner::new("ads"));
//! install(&context, services, EngineConfig::default())?;
//! context.get::<AdServing>().start_serving_ads_at_regular_intervals();
//! ```

use std::sync::Arc;

use adsched_async::{Clock, Context, ContextError, SystemClock};

pub mod ad_events;
pub mod catalog;
pub mod config;
pub mod eligible_ads;
pub mod frequency_capping;
pub mod pacing;
pub mod priority;
pub mod rng;
pub mod round_robin;
pub mod serving;
pub mod store;

pub use config::{Config, EngineConfig};
pub use rng::AdRng;

use store::{
    AdDelivery, AdEventStore, BrowsingHistory, ClientState, CreativeAdStore, MemoryStore,
    SegmentSource,
};

/// The collaborators an engine is built from.
#[derive(Clone)]
pub struct Services {
    pub creative_ads: Arc<dyn CreativeAdStore>,
    pub ad_events: Arc<dyn AdEventStore>,
    pub browsing_history: Arc<dyn BrowsingHistory>,
    pub client_state: Arc<dyn ClientState>,
    pub delivery: Arc<dyn AdDelivery>,
    pub segments: Arc<dyn SegmentSource>,
    pub clock: Arc<dyn Clock>,
    pub rng: Arc<AdRng>,
}

impl Services {
    /// Services where every store is the same [`MemoryStore`].
    pub fn memory(
        store: Arc<MemoryStore>,
        delivery: Arc<dyn AdDelivery>,
        segments: Arc<dyn SegmentSource>,
        clock: Arc<dyn Clock>,
        rng: Arc<AdRng>,
    ) -> Self {
        Self {
            creative_ads: store.clone(),
            ad_events: store.clone(),
            browsing_history: store.clone(),
            client_state: store,
            delivery,
            segments,
            clock,
            rng,
        }
    }
}

/// Provide `services` and `config` to `context`.
pub fn install(context: &Context, services: Services, config: EngineConfig) -> Result<(), ContextError> {
    context.provide::<dyn CreativeAdStore>(services.creative_ads)?;
    context.provide::<dyn AdEventStore>(services.ad_events)?;
    context.provide::<dyn BrowsingHistory>(services.browsing_history)?;
    context.provide::<dyn ClientState>(services.client_state)?;
    context.provide::<dyn AdDelivery>(services.delivery)?;
    context.provide::<dyn SegmentSource>(services.segments)?;
    context.provide::<dyn Clock>(services.clock)?;
    context.provide(services.rng)?;
    context.provide(Arc::new(config))?;
    Ok(())
}

/// The context's engine config, or the defaults if none was provided.
pub(crate) fn engine_config(context: &Context) -> Arc<EngineConfig> {
    context
        .service::<EngineConfig>()
        .unwrap_or_else(|_| Arc::new(EngineConfig::default()))
}

/// The context's clock, or the system clock if none was provided.
pub(crate) fn clock(context: &Context) -> Arc<dyn Clock> {
    context
        .service::<dyn Clock>()
        .unwrap_or_else(|_| Arc::new(SystemClock))
}

#[cfg(test)]
mod test_support;
