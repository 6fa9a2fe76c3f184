//! Eligible ad selection.
//!
//! [`EligibleAdsJob`] answers "which ads may be shown right now?" for a set
//! of user segments. It loads the ad event log and browsing history, checks
//! the coarse permission gate, then walks segment levels from most to least
//! specific:
//!
//! 1. the segments as given (`parent-child`)
//! 2. their parents
//! 3. the untargeted pool
//!
//! Each level's candidates go through the same pipeline: advertiser round
//! robin, ad round robin, frequency capping with last-served exclusion,
//! pacing, then prioritization. The first level with survivors wins.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use adsched_async::{Context, ContextError, Job, JobScope};
use adsched_events::segment::{normalize, parent_segments, UNTARGETED};
use adsched_events::{AdEvent, CreativeAd};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::ad_events::AdEventHistory;
use crate::frequency_capping::FrequencyCapping;
use crate::pacing::pace_ads;
use crate::priority::prioritize_ads;
use crate::rng::AdRng;
use crate::round_robin::{
    filter_seen_ads_and_round_robin_if_needed, filter_seen_advertisers_and_round_robin_if_needed,
};
use crate::store::{BrowsingHistory, ClientState, CreativeAdStore, StoreError};
use crate::{clock, engine_config, EngineConfig};

/// Outcome of an eligibility evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EligibleAds {
    /// False when serving must not be attempted this cycle.
    pub is_allowed: bool,
    pub ads: Vec<CreativeAd>,
}

impl EligibleAds {
    pub fn denied() -> Self {
        Self::default()
    }

    pub fn allowed(ads: Vec<CreativeAd>) -> Self {
        Self {
            is_allowed: true,
            ads,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EligibleAdsRequest {
    pub segments: Vec<String>,

    /// The ad served last, excluded unless it is the only candidate.
    pub last_served: Option<CreativeAd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentLevel {
    ParentChild,
    Parent,
    Untargeted,
}

impl fmt::Display for SegmentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentLevel::ParentChild => "parent-child",
            SegmentLevel::Parent => "parent",
            SegmentLevel::Untargeted => "untargeted",
        };
        f.write_str(name)
    }
}

struct Collaborators {
    creative_ads: Arc<dyn CreativeAdStore>,
    browsing_history: Arc<dyn BrowsingHistory>,
    client: Arc<dyn ClientState>,
    rng: Arc<AdRng>,
    config: Arc<EngineConfig>,
}

impl Collaborators {
    fn from_context(context: &Context) -> Result<Self, ContextError> {
        Ok(Self {
            creative_ads: context.service::<dyn CreativeAdStore>()?,
            browsing_history: context.service::<dyn BrowsingHistory>()?,
            client: context.service::<dyn ClientState>()?,
            rng: context.service::<AdRng>()?,
            config: engine_config(context),
        })
    }
}

/// Selects eligible ads for a set of segments.
#[derive(Default)]
pub struct EligibleAdsJob {
    collaborators: Option<Collaborators>,
    now: Option<DateTime<Utc>>,
    last_served: Option<CreativeAd>,
    ad_events: Option<Vec<AdEvent>>,
    history: Option<Vec<String>>,
    levels: VecDeque<(SegmentLevel, Vec<String>)>,
}

impl Job for EligibleAdsJob {
    type Input = EligibleAdsRequest;
    type Output = EligibleAds;
    const NAME: &'static str = "eligible_ads";

    fn start(&mut self, scope: &JobScope<Self>, request: EligibleAdsRequest) {
        let collaborators = match Collaborators::from_context(scope.context()) {
            Ok(collaborators) => collaborators,
            Err(e) => {
                warn!(error = %e, "Cannot evaluate eligible ads");
                scope.complete(EligibleAds::denied());
                return;
            }
        };

        self.now = Some(clock(scope.context()).now());
        self.last_served = request.last_served;
        self.levels = segment_levels(&request.segments);

        let eligibility = &collaborators.config.eligibility;
        let history = collaborators.browsing_history.get(
            eligibility.browsing_history_max_count,
            eligibility.browsing_history_days_ago,
        );
        self.collaborators = Some(collaborators);

        scope
            .context()
            .get::<AdEventHistory>()
            .get_all()
            .then(scope.continue_with(Self::on_ad_events));
        history.then(scope.continue_with(Self::on_browsing_history));
    }
}

impl EligibleAdsJob {
    fn on_ad_events(&mut self, scope: &JobScope<Self>, result: Result<Vec<AdEvent>, StoreError>) {
        match result {
            Ok(events) => {
                self.ad_events = Some(events);
                self.maybe_evaluate(scope);
            }
            Err(e) => {
                warn!(error = %e, "Failed to get ad events");
                scope.complete(EligibleAds::denied());
            }
        }
    }

    fn on_browsing_history(&mut self, scope: &JobScope<Self>, result: Result<Vec<String>, StoreError>) {
        match result {
            Ok(history) => {
                self.history = Some(history);
                self.maybe_evaluate(scope);
            }
            Err(e) => {
                warn!(error = %e, "Failed to get browsing history");
                scope.complete(EligibleAds::denied());
            }
        }
    }

    fn maybe_evaluate(&mut self, scope: &JobScope<Self>) {
        let (Some(collaborators), Some(events), Some(history), Some(now)) =
            (&self.collaborators, &self.ad_events, &self.history, self.now)
        else {
            return;
        };

        let capping = FrequencyCapping::new(&collaborators.config.frequency_caps, events, history, now);
        if !capping.is_ad_allowed() {
            info!("Ad not allowed by frequency caps");
            scope.complete(EligibleAds::denied());
            return;
        }

        self.next_level(scope);
    }

    fn next_level(&mut self, scope: &JobScope<Self>) {
        let (Some(collaborators), Some(now)) = (&self.collaborators, self.now) else {
            return;
        };
        let Some((level, segments)) = self.levels.front() else {
            info!("No eligible ads");
            scope.complete(EligibleAds::allowed(Vec::new()));
            return;
        };

        debug!(level = %level, segments = ?segments, "Getting eligible ads");
        collaborators
            .creative_ads
            .get_for_segments(segments, now)
            .then(scope.continue_with(Self::on_creative_ads));
    }

    fn on_creative_ads(&mut self, scope: &JobScope<Self>, result: Result<Vec<CreativeAd>, StoreError>) {
        let ads = match result {
            Ok(ads) => ads,
            Err(e) => {
                warn!(error = %e, "Failed to get creative ads");
                scope.complete(EligibleAds::denied());
                return;
            }
        };
        let Some((level, _)) = self.levels.pop_front() else {
            return;
        };

        let candidates = ads.len();
        let eligible = self.filter(ads);
        debug!(level = %level, candidates, eligible = eligible.len(), "Filtered ads");

        if eligible.is_empty() {
            self.next_level(scope);
            return;
        }

        info!(level = %level, count = eligible.len(), "Found eligible ads");
        scope.complete(EligibleAds::allowed(eligible));
    }

    fn filter(&self, ads: Vec<CreativeAd>) -> Vec<CreativeAd> {
        let (Some(collaborators), Some(events), Some(history), Some(now)) =
            (&self.collaborators, &self.ad_events, &self.history, self.now)
        else {
            return Vec::new();
        };
        let client = collaborators.client.as_ref();
        let pool_size = ads.len();

        let ads = filter_seen_advertisers_and_round_robin_if_needed(ads, client);
        let mut ads = filter_seen_ads_and_round_robin_if_needed(ads, client);

        let capping = FrequencyCapping::new(&collaborators.config.frequency_caps, events, history, now);
        ads.retain(|ad| !capping.should_exclude_ad(ad));

        if pool_size > 1 {
            if let Some(last) = &self.last_served {
                ads.retain(|ad| ad.creative_instance_id != last.creative_instance_id);
            }
        }

        prioritize_ads(pace_ads(ads, &collaborators.rng))
    }
}

fn segment_levels(segments: &[String]) -> VecDeque<(SegmentLevel, Vec<String>)> {
    let untargeted = (SegmentLevel::Untargeted, vec![UNTARGETED.to_string()]);
    if segments.is_empty() {
        return VecDeque::from([untargeted]);
    }
    VecDeque::from([
        (SegmentLevel::ParentChild, normalize(segments)),
        (SegmentLevel::Parent, parent_segments(segments)),
        untargeted,
    ])
}
