//! Shared fixtures for adsched tests.
//!
//! - [`CreativeAdBuilder`]: catalog entries with permissive defaults
//! - [`AdEventBuilder`]: ad event log entries
//! - [`init_tracing`]: test-writer subscriber, safe to call from every test

use std::sync::Once;

use adsched_events::{AdEvent, AdType, ConfirmationType, CreativeAd, Daypart};
use adsched_id::{AdUuid, AdvertiserId, CampaignId, CreativeInstanceId, CreativeSetId};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing_subscriber::EnvFilter;

/// Monday 2026-10-19 09:00:00 UTC. Tests anchor their clocks here.
pub fn monday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Install a test-writer subscriber once per process. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// =============================================================================
// Creative ads
// =============================================================================

/// Builder for [`CreativeAd`] with no caps, full pacing, and a one-year
/// flight around [`monday_morning`].
#[derive(Debug, Clone)]
pub struct CreativeAdBuilder {
    ad: CreativeAd,
}

impl CreativeAdBuilder {
    pub fn new(segment: &str) -> Self {
        let now = monday_morning();
        Self {
            ad: CreativeAd {
                creative_instance_id: CreativeInstanceId::new(),
                creative_set_id: CreativeSetId::new(),
                campaign_id: CampaignId::new(),
                advertiser_id: AdvertiserId::new(),
                segment: segment.to_string(),
                per_day: 100,
                total_max: 1000,
                daily_cap: 0,
                priority: 1,
                ptr: 1.0,
                dayparts: vec![Daypart::default()],
                geo_targets: Vec::new(),
                start_at: now - Duration::days(180),
                end_at: now + Duration::days(180),
                title: format!("Ad for {segment}"),
                body: "Test body".to_string(),
                target_url: "https://advertiser.example.com".to_string(),
            },
        }
    }

    pub fn creative_instance_id(mut self, id: CreativeInstanceId) -> Self {
        self.ad.creative_instance_id = id;
        self
    }

    pub fn creative_set_id(mut self, id: CreativeSetId) -> Self {
        self.ad.creative_set_id = id;
        self
    }

    pub fn campaign_id(mut self, id: CampaignId) -> Self {
        self.ad.campaign_id = id;
        self
    }

    pub fn advertiser_id(mut self, id: AdvertiserId) -> Self {
        self.ad.advertiser_id = id;
        self
    }

    pub fn per_day(mut self, per_day: u32) -> Self {
        self.ad.per_day = per_day;
        self
    }

    pub fn total_max(mut self, total_max: u32) -> Self {
        self.ad.total_max = total_max;
        self
    }

    pub fn daily_cap(mut self, daily_cap: u32) -> Self {
        self.ad.daily_cap = daily_cap;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.ad.priority = priority;
        self
    }

    pub fn ptr(mut self, ptr: f64) -> Self {
        self.ad.ptr = ptr;
        self
    }

    pub fn dayparts(mut self, dayparts: Vec<Daypart>) -> Self {
        self.ad.dayparts = dayparts;
        self
    }

    pub fn geo_targets(mut self, targets: &[&str]) -> Self {
        self.ad.geo_targets = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn flight(mut self, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Self {
        self.ad.start_at = start_at;
        self.ad.end_at = end_at;
        self
    }

    pub fn target_url(mut self, url: &str) -> Self {
        self.ad.target_url = url.to_string();
        self
    }

    pub fn build(self) -> CreativeAd {
        self.ad
    }
}

/// A creative ad for `segment` with builder defaults.
pub fn creative_ad(segment: &str) -> CreativeAd {
    CreativeAdBuilder::new(segment).build()
}

// =============================================================================
// Ad events
// =============================================================================

/// Builder for [`AdEvent`] entries that refer to a creative ad.
#[derive(Debug, Clone)]
pub struct AdEventBuilder {
    event: AdEvent,
}

impl AdEventBuilder {
    pub fn for_creative(ad: &CreativeAd, confirmation_type: ConfirmationType) -> Self {
        Self {
            event: AdEvent {
                ad_uuid: AdUuid::new(),
                creative_instance_id: ad.creative_instance_id,
                creative_set_id: ad.creative_set_id,
                campaign_id: ad.campaign_id,
                advertiser_id: ad.advertiser_id,
                ad_type: AdType::AdNotification,
                confirmation_type,
                created_at: monday_morning(),
            },
        }
    }

    pub fn ad_type(mut self, ad_type: AdType) -> Self {
        self.event.ad_type = ad_type;
        self
    }

    pub fn ad_uuid(mut self, uuid: AdUuid) -> Self {
        self.event.ad_uuid = uuid;
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.event.created_at = created_at;
        self
    }

    pub fn build(self) -> AdEvent {
        self.event
    }
}

/// A served ad notification event for `ad` at `at`.
pub fn served(ad: &CreativeAd, at: DateTime<Utc>) -> AdEvent {
    AdEventBuilder::for_creative(ad, ConfirmationType::Served)
        .at(at)
        .build()
}

/// `count` served events for `ad`, one second apart, ending at `at`.
pub fn served_n(ad: &CreativeAd, count: usize, at: DateTime<Utc>) -> Vec<AdEvent> {
    (0..count)
        .map(|i| served(ad, at - Duration::seconds(i as i64)))
        .collect()
}
