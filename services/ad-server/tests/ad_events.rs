//! Recording confirmations with `FireAdEventJob`.

mod common;

use std::sync::Arc;

use adsched_async::ManualClock;
use adsched_events::{AdType, ConfirmationType, CreativeAd};
use adsched_id::AdUuid;
use adsched_server::ad_events::{AdEventError, FireAdEventJob, FireAdEventRequest};
use adsched_server::store::CreativeAdStore;
use adsched_server::EngineConfig;
use adsched_testing::{creative_ad, monday_morning};
use common::Harness;
use rstest::rstest;

fn harness() -> Harness {
    Harness::new(EngineConfig::default(), Arc::new(ManualClock::new(monday_morning())))
}

fn fire(
    harness: &Harness,
    uuid: &str,
    ad: &CreativeAd,
    ad_type: AdType,
    confirmation_type: ConfirmationType,
) -> Result<adsched_events::AdEvent, AdEventError> {
    let request = FireAdEventRequest {
        uuid: uuid.to_string(),
        creative_instance_id: ad.creative_instance_id.to_string(),
        ad_type,
        confirmation_type,
    };
    let result = harness.context.start_job(FireAdEventJob::default(), request);
    harness.drain(result)
}

#[rstest]
#[case::empty("")]
#[case::blank("   ")]
#[case::not_a_uuid("placement-1")]
fn test_rejects_bad_uuid(#[case] uuid: &str) {
    let harness = harness();
    let ad = creative_ad("travel");
    harness.store.save(&[ad.clone()]);

    let result = fire(&harness, uuid, &ad, AdType::InlineContentAd, ConfirmationType::Viewed);
    assert!(matches!(result, Err(AdEventError::InvalidRequest(_))));
    assert!(harness.store.events().is_empty());
}

#[test]
fn test_view_then_click() {
    let harness = harness();
    let ad = creative_ad("travel");
    harness.store.save(&[ad.clone()]);
    let uuid = AdUuid::new().to_string();

    let viewed = fire(&harness, &uuid, &ad, AdType::InlineContentAd, ConfirmationType::Viewed).unwrap();
    let clicked = fire(&harness, &uuid, &ad, AdType::InlineContentAd, ConfirmationType::Clicked).unwrap();

    assert_eq!(viewed.ad_uuid, clicked.ad_uuid);
    assert_eq!(viewed.created_at, monday_morning());
    assert_eq!(harness.store.events(), vec![viewed, clicked]);
    assert_eq!(harness.context.job_count(), 0);
}

#[test]
fn test_viewed_cap_is_configurable() {
    let mut config = EngineConfig::default();
    config.frequency_caps.ad_uuid_viewed_cap = 2;
    let harness = Harness::new(config, Arc::new(ManualClock::new(monday_morning())));
    let ad = creative_ad("travel");
    harness.store.save(&[ad.clone()]);
    let uuid = AdUuid::new().to_string();

    for _ in 0..2 {
        assert!(fire(&harness, &uuid, &ad, AdType::PromotedContentAd, ConfirmationType::Viewed).is_ok());
    }
    let third = fire(&harness, &uuid, &ad, AdType::PromotedContentAd, ConfirmationType::Viewed);
    assert!(matches!(third, Err(AdEventError::NotAllowed(_))));
}

#[test]
fn test_store_outage_is_reported() {
    let harness = harness();
    let ad = creative_ad("travel");
    harness.store.save(&[ad.clone()]);
    harness.store.set_failing(true);

    let result = fire(
        &harness,
        &AdUuid::new().to_string(),
        &ad,
        AdType::InlineContentAd,
        ConfirmationType::Viewed,
    );
    assert!(matches!(result, Err(AdEventError::Store(_))));
}
