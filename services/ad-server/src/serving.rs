//! The ad serving scheduler.
//!
//! [`AdServing`] runs one serving cycle per timer firing:
//!
//! ```text
//! Idle -> TimerScheduled -> Evaluating -> Served --------> TimerScheduled
//!                                      \-> FailedToServe -/
//! ```
//!
//! A cycle asks [`EligibleAdsJob`] for candidates, picks one uniformly,
//! and hands it to [`AdDelivery`]. With fixed cadence the timer is re-armed
//! after every cycle: just past `3600s / ads_per_hour` after a delivery, the
//! failure backoff otherwise. The next firing time is persisted in
//! [`ClientState`] so a restart resumes the schedule.
//!
//! Stopping bumps a generation counter. A cycle already evaluating when
//! serving stops runs to completion but its result is discarded. A cycle
//! whose evaluation is abandoned counts as a failure.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use adsched_async::{AsyncResult, Component, Context, Resolver, TaskRunner, Timer, WeakContext};
use adsched_events::{AdEvent, AdNotification, AdType, ConfirmationType, CreativeAd};
use adsched_id::AdUuid;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::ad_events::AdEventHistory;
use crate::eligible_ads::{EligibleAds, EligibleAdsJob, EligibleAdsRequest};
use crate::rng::AdRng;
use crate::store::{AdDelivery, AdOpportunityRecorder, ClientState, SegmentSource};
use crate::{clock, engine_config};

/// Added to the wait after a delivery. The minimum wait rule counts a
/// served event at exactly `now - wait`, so the next cycle lands past it.
const SERVED_AD_GRACE: Duration = Duration::from_secs(1);

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingPhase {
    Idle,
    TimerScheduled,
    Evaluating,
    Served,
    FailedToServe,
}

struct ServingState {
    phase: ServingPhase,
    timer: Timer,
    generation: u64,
    last_served: Option<CreativeAd>,
}

struct ServingInner {
    context: WeakContext,
    runner: TaskRunner,
    state: Mutex<ServingState>,
}

/// Serves ads at regular intervals.
pub struct AdServing {
    inner: Arc<ServingInner>,
}

impl Component for AdServing {
    const NAME: &'static str = "ad_serving";

    fn create(context: &Context) -> Self {
        Self {
            inner: Arc::new(ServingInner {
                context: context.downgrade(),
                runner: context.runner().clone(),
                state: Mutex::new(ServingState {
                    phase: ServingPhase::Idle,
                    timer: Timer::new(),
                    generation: 0,
                    last_served: None,
                }),
            }),
        }
    }
}

impl AdServing {
    pub fn state(&self) -> ServingPhase {
        self.inner.state().phase
    }

    pub fn last_served_creative_ad(&self) -> Option<CreativeAd> {
        self.inner.state().last_served.clone()
    }

    /// When the next cycle is due, as persisted in client state.
    pub fn next_serving_interval(&self) -> Option<DateTime<Utc>> {
        let context = self.inner.context.upgrade()?;
        context.service::<dyn ClientState>().ok()?.next_serving_interval()
    }

    /// Arm the serving timer. Does nothing if it is already armed. Must be
    /// called within a tokio runtime.
    pub fn start_serving_ads_at_regular_intervals(&self) {
        self.inner.start();
    }

    /// Disarm the serving timer and discard any cycle in flight.
    pub fn stop_serving_ads_at_regular_intervals(&self) {
        self.inner.stop();
    }

    /// Run one serving cycle now. Completes with the delivered ad, if any.
    #[instrument(skip_all, fields(runner = %self.inner.runner.name()))]
    pub fn maybe_serve_ad(&self) -> AsyncResult<Option<AdNotification>> {
        ServingInner::maybe_serve_ad(&self.inner)
    }
}

impl ServingState {
    /// A start that arrived mid-cycle armed the timer; report it.
    fn keep_started_timer(&mut self) {
        if self.timer.is_running() {
            self.phase = ServingPhase::TimerScheduled;
        }
    }
}

impl ServingInner {
    fn state(&self) -> MutexGuard<'_, ServingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Timer
    // =========================================================================

    fn start(self: &Arc<Self>) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        let client = match context.service::<dyn ClientState>() {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Cannot start serving ads");
                return;
            }
        };
        let config = engine_config(&context);
        let now = clock(&context).now();

        let mut state = self.state();
        if state.timer.is_running() {
            debug!(phase = ?state.phase, "Already serving ads");
            return;
        }

        let delay = match client.next_serving_interval() {
            None => {
                let delay = config.serving.initial_delay;
                persist_next_serving_interval(client.as_ref(), now, delay);
                delay
            }
            Some(next) if now >= next => config.serving.retry_delay,
            Some(next) => (next - now).to_std().unwrap_or(config.serving.retry_delay),
        };

        info!(delay_secs = delay.as_secs(), "Start serving ads at regular intervals");
        self.arm(&mut state, delay);
    }

    fn stop(&self) {
        let mut state = self.state();
        let was_running = state.timer.stop();
        state.generation += 1;
        state.phase = ServingPhase::Idle;
        if was_running {
            info!("Stopped serving ads at regular intervals");
        }
    }

    /// Arm the timer. A cycle in flight keeps the `Evaluating` phase.
    fn arm(self: &Arc<Self>, state: &mut ServingState, delay: Duration) {
        let serving = Arc::downgrade(self);
        state.timer.start(&self.runner, delay, move || {
            if let Some(serving) = serving.upgrade() {
                let _ = ServingInner::maybe_serve_ad(&serving);
            }
        });
        if state.phase != ServingPhase::Evaluating {
            state.phase = ServingPhase::TimerScheduled;
        }
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    fn maybe_serve_ad(self: &Arc<Self>) -> AsyncResult<Option<AdNotification>> {
        let resolver = Resolver::new(&self.runner);
        let served = resolver.result();

        let Some(context) = self.context.upgrade() else {
            let _ = resolver.complete(None);
            return served;
        };
        let segments = match context.service::<dyn SegmentSource>() {
            Ok(source) => source.segments(),
            Err(e) => {
                warn!(error = %e, "Cannot serve ads");
                let _ = resolver.complete(None);
                return served;
            }
        };

        let (generation, last_served) = {
            let mut state = self.state();
            if state.phase == ServingPhase::Evaluating {
                debug!("Already evaluating eligible ads");
                let _ = resolver.complete(None);
                return served;
            }
            state.timer.stop();
            state.phase = ServingPhase::Evaluating;
            (state.generation, state.last_served.clone())
        };

        debug!(segments = ?segments, "Serving ad");
        let mut eligible = context.start_job(
            EligibleAdsJob::default(),
            EligibleAdsRequest {
                segments: segments.clone(),
                last_served,
            },
        );
        if let Some(timeout) = engine_config(&context).serving.eligibility_timeout {
            eligible = eligible.with_timeout(timeout, EligibleAds::denied());
        }

        let serving: Weak<Self> = Arc::downgrade(self);
        eligible.settled_on(&self.runner, move |eligible| match serving.upgrade() {
            Some(serving) => serving.on_eligible_ads(generation, &segments, eligible, resolver),
            None => {
                let _ = resolver.complete(None);
            }
        });
        served
    }

    fn on_eligible_ads(
        self: &Arc<Self>,
        generation: u64,
        segments: &[String],
        eligible: Option<EligibleAds>,
        resolver: Resolver<Option<AdNotification>>,
    ) {
        if self.state().generation != generation {
            debug!("Serving stopped, discarding cycle result");
            let _ = resolver.complete(None);
            return;
        }
        let Some(context) = self.context.upgrade() else {
            let _ = resolver.complete(None);
            return;
        };
        let Some(eligible) = eligible else {
            warn!("Eligible ads evaluation abandoned");
            self.failed_to_serve_ad(&context);
            let _ = resolver.complete(None);
            return;
        };

        if eligible.is_allowed {
            record_ad_opportunity(&context, segments);
        }

        match self.deliver(&context, eligible) {
            Some(ad) => {
                self.served_ad(&context);
                let _ = resolver.complete(Some(ad));
            }
            None => {
                self.failed_to_serve_ad(&context);
                let _ = resolver.complete(None);
            }
        }
    }

    fn deliver(&self, context: &Context, eligible: EligibleAds) -> Option<AdNotification> {
        if !eligible.is_allowed {
            info!("Ad notification not delivered: not allowed");
            return None;
        }
        if eligible.ads.is_empty() {
            info!("Ad notification not delivered: no eligible ads");
            return None;
        }

        let (delivery, client, rng) = match (
            context.service::<dyn AdDelivery>(),
            context.service::<dyn ClientState>(),
            context.service::<AdRng>(),
        ) {
            (Ok(delivery), Ok(client), Ok(rng)) => (delivery, client, rng),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                warn!(error = %e, "Cannot deliver ad");
                return None;
            }
        };

        let index = rng.with(|rng| rng.random_range(0..eligible.ads.len()));
        let creative = &eligible.ads[index];
        let ad = AdNotification::from_creative(creative, AdType::AdNotification, AdUuid::new());

        if !delivery.maybe_deliver_ad(&ad) {
            warn!(creative_instance_id = %ad.creative_instance_id, "Ad notification not delivered");
            return None;
        }
        info!(
            ad_uuid = %ad.uuid,
            creative_instance_id = %ad.creative_instance_id,
            segment = %ad.segment,
            "Delivered ad notification"
        );

        self.state().last_served = Some(creative.clone());

        let event = AdEvent::for_ad(&ad, ConfirmationType::Served, clock(context).now());
        context
            .get::<AdEventHistory>()
            .record(&event)
            .then_on(&self.runner, |result| {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to record served ad event");
                }
            });

        if let Err(e) = client.mark_ad_seen(ad.creative_instance_id) {
            warn!(error = %e, "Failed to mark ad as seen");
        }
        if let Err(e) = client.mark_advertiser_seen(ad.advertiser_id) {
            warn!(error = %e, "Failed to mark advertiser as seen");
        }

        Some(ad)
    }

    fn served_ad(self: &Arc<Self>, context: &Context) {
        let config = engine_config(context);
        let mut state = self.state();
        state.phase = ServingPhase::Served;
        if !config.serving.fixed_cadence {
            state.keep_started_timer();
            return;
        }

        let delay = config
            .frequency_caps
            .minimum_wait_time()
            .map_or(config.serving.failure_backoff, |wait| wait + SERVED_AD_GRACE);
        self.schedule_next(context, &mut state, delay);
    }

    fn failed_to_serve_ad(self: &Arc<Self>, context: &Context) {
        let config = engine_config(context);
        let mut state = self.state();
        state.phase = ServingPhase::FailedToServe;
        if !config.serving.fixed_cadence {
            state.keep_started_timer();
            return;
        }

        self.schedule_next(context, &mut state, config.serving.failure_backoff);
    }

    fn schedule_next(self: &Arc<Self>, context: &Context, state: &mut ServingState, delay: Duration) {
        if let Ok(client) = context.service::<dyn ClientState>() {
            persist_next_serving_interval(client.as_ref(), clock(context).now(), delay);
        }
        info!(delay_secs = delay.as_secs(), "Scheduled next ad");
        self.arm(state, delay);
    }
}

fn record_ad_opportunity(context: &Context, segments: &[String]) {
    info!(segments = ?segments, "Ad opportunity");
    if let Ok(recorder) = context.service::<dyn AdOpportunityRecorder>() {
        recorder.record_ad_opportunity(segments);
    }
}

fn persist_next_serving_interval(client: &dyn ClientState, now: DateTime<Utc>, delay: Duration) {
    let next = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if let Err(e) = client.set_next_serving_interval(next) {
        warn!(error = %e, "Failed to persist next serving interval");
    }
}
