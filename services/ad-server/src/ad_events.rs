//! The ad event log as the engine sees it.
//!
//! [`AdEventHistory`] coalesces concurrent reads of the full log, which
//! every serving cycle and every viewed confirmation needs.
//! [`FireAdEventJob`] records a confirmation (viewed, clicked, ...) for a
//! placement after checking it is allowed.

use std::sync::Arc;

use adsched_async::{AsyncDebouncer, AsyncResult, Component, Context, ContextError, Job, JobScope, TaskRunner};
use adsched_events::{AdEvent, AdNotification, AdType, ConfirmationType, CreativeAd};
use adsched_id::{AdUuid, CreativeInstanceId};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frequency_capping::{AdUuidFrequencyCap, ExclusionRule, FrequencyCapping};
use crate::store::{AdEventStore, CreativeAdStore, StoreError, StoreResult};
use crate::{clock, engine_config};

// =============================================================================
// History
// =============================================================================

/// Debounced access to the ad event store.
pub struct AdEventHistory {
    store: Result<Arc<dyn AdEventStore>, ContextError>,
    debouncer: Arc<AsyncDebouncer<(), Result<Vec<AdEvent>, StoreError>>>,
    runner: TaskRunner,
}

impl Component for AdEventHistory {
    const NAME: &'static str = "ad_event_history";

    fn create(context: &Context) -> Self {
        let config = engine_config(context);
        Self {
            store: context.service::<dyn AdEventStore>(),
            debouncer: Arc::new(AsyncDebouncer::new(
                context.runner(),
                clock(context),
                config.eligibility.ad_events_max_age,
            )),
            runner: context.runner().clone(),
        }
    }
}

impl AdEventHistory {
    /// The whole event log. Concurrent callers share one store read.
    pub fn get_all(&self) -> StoreResult<Vec<AdEvent>> {
        match self.store() {
            Ok(store) => self.debouncer.get(move || store.get_all()),
            Err(e) => AsyncResult::ready(&self.runner, Err(e)),
        }
    }

    /// Append `event` and drop any cached log.
    pub fn record(&self, event: &AdEvent) -> StoreResult<()> {
        match self.store() {
            Ok(store) => {
                let debouncer = self.debouncer.clone();
                store.append(event).map(move |result| {
                    debouncer.invalidate(&());
                    result
                })
            }
            Err(e) => AsyncResult::ready(&self.runner, Err(e)),
        }
    }

    /// Delete events created before `cutoff` and drop any cached log.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        match self.store() {
            Ok(store) => {
                let debouncer = self.debouncer.clone();
                store.purge_older_than(cutoff).map(move |result| {
                    debouncer.invalidate(&());
                    if let Ok(purged) = &result {
                        info!(purged, cutoff = %cutoff, "Purged ad events");
                    }
                    result
                })
            }
            Err(e) => AsyncResult::ready(&self.runner, Err(e)),
        }
    }

    fn store(&self) -> Result<Arc<dyn AdEventStore>, StoreError> {
        self.store
            .clone()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

// =============================================================================
// Firing confirmations
// =============================================================================

/// Errors from recording a confirmation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdEventError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("creative instance {0} not found")]
    NotFound(CreativeInstanceId),

    #[error("not allowed: {0}")]
    NotAllowed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A confirmation reported by the embedder for a placement it showed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireAdEventRequest {
    pub uuid: String,
    pub creative_instance_id: String,
    pub ad_type: AdType,
    pub confirmation_type: ConfirmationType,
}

/// Validates a confirmation and appends it to the event log.
#[derive(Debug, Default)]
pub struct FireAdEventJob {
    uuid: Option<AdUuid>,
    creative_instance_id: Option<CreativeInstanceId>,
    ad_type: Option<AdType>,
    confirmation_type: Option<ConfirmationType>,
    ad: Option<AdNotification>,
    event: Option<AdEvent>,
}

impl Job for FireAdEventJob {
    type Input = FireAdEventRequest;
    type Output = Result<AdEvent, AdEventError>;
    const NAME: &'static str = "fire_ad_event";

    fn start(&mut self, scope: &JobScope<Self>, request: FireAdEventRequest) {
        let ids = AdUuid::parse(&request.uuid).and_then(|uuid| {
            CreativeInstanceId::parse(&request.creative_instance_id).map(|id| (uuid, id))
        });
        let (uuid, creative_instance_id) = match ids {
            Ok(ids) => ids,
            Err(e) => return self.fail(scope, AdEventError::InvalidRequest(e.to_string())),
        };
        if request.confirmation_type == ConfirmationType::Served {
            return self.fail(
                scope,
                AdEventError::InvalidRequest("served events are recorded by the scheduler".to_string()),
            );
        }

        let store = match scope.context().service::<dyn CreativeAdStore>() {
            Ok(store) => store,
            Err(e) => return self.fail(scope, StoreError::Unavailable(e.to_string()).into()),
        };

        self.uuid = Some(uuid);
        self.creative_instance_id = Some(creative_instance_id);
        self.ad_type = Some(request.ad_type);
        self.confirmation_type = Some(request.confirmation_type);

        store
            .get_for_creative_instance_id(creative_instance_id)
            .then(scope.continue_with(Self::on_creative_ad));
    }
}

impl FireAdEventJob {
    fn on_creative_ad(&mut self, scope: &JobScope<Self>, result: Result<CreativeAd, StoreError>) {
        let (Some(uuid), Some(ad_type), Some(creative_instance_id)) =
            (self.uuid, self.ad_type, self.creative_instance_id)
        else {
            return;
        };
        let creative = match result {
            Ok(creative) => creative,
            Err(StoreError::NotFound(_)) => {
                return self.fail(scope, AdEventError::NotFound(creative_instance_id));
            }
            Err(e) => return self.fail(scope, e.into()),
        };
        self.ad = Some(AdNotification::from_creative(&creative, ad_type, uuid));

        if self.confirmation_type == Some(ConfirmationType::Viewed) {
            scope
                .context()
                .get::<AdEventHistory>()
                .get_all()
                .then(scope.continue_with(Self::on_ad_events));
        } else {
            self.append(scope);
        }
    }

    fn on_ad_events(&mut self, scope: &JobScope<Self>, result: Result<Vec<AdEvent>, StoreError>) {
        let events = match result {
            Ok(events) => events,
            Err(e) => return self.fail(scope, e.into()),
        };
        let Some(ad) = &self.ad else {
            return;
        };

        let config = engine_config(scope.context());
        let now = clock(scope.context()).now();
        let caps = &config.frequency_caps;

        // Ad notifications were gated when they were served.
        if ad.ad_type != AdType::AdNotification
            && !FrequencyCapping::new(caps, &events, &[], now).is_ad_type_allowed(ad.ad_type)
        {
            let message = format!("{} has reached its daily view cap", ad.ad_type);
            return self.fail(scope, AdEventError::NotAllowed(message));
        }

        let mut viewed_cap = AdUuidFrequencyCap::new(&events, caps.ad_uuid_viewed_cap);
        if viewed_cap.should_exclude(ad) {
            let message = viewed_cap.last_message().to_string();
            return self.fail(scope, AdEventError::NotAllowed(message));
        }

        self.append(scope);
    }

    fn append(&mut self, scope: &JobScope<Self>) {
        let (Some(ad), Some(confirmation_type)) = (&self.ad, self.confirmation_type) else {
            return;
        };
        let event = AdEvent::for_ad(ad, confirmation_type, clock(scope.context()).now());
        let recorded = scope.context().get::<AdEventHistory>().record(&event);
        self.event = Some(event);
        recorded.then(scope.continue_with(Self::on_appended));
    }

    fn on_appended(&mut self, scope: &JobScope<Self>, result: Result<(), StoreError>) {
        if let Err(e) = result {
            return self.fail(scope, e.into());
        }
        let Some(event) = self.event.take() else {
            return;
        };
        info!(
            ad_uuid = %event.ad_uuid,
            creative_instance_id = %event.creative_instance_id,
            ad_type = %event.ad_type,
            confirmation_type = %event.confirmation_type,
            "Recorded ad event"
        );
        scope.complete(Ok(event));
    }

    fn fail(&mut self, scope: &JobScope<Self>, error: AdEventError) {
        match &error {
            AdEventError::NotAllowed(reason) => debug!(reason = %reason, "Ad event not allowed"),
            other => warn!(error = %other, "Failed to fire ad event"),
        }
        scope.complete(Err(error));
    }
}
