//! Serving scheduler scenarios on paused tokio time.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use adsched_async::{Clock, Context, Resolver, TaskRunner, TokioClock};
use adsched_events::CreativeAd;
use adsched_id::CreativeInstanceId;
use adsched_server::serving::{AdServing, ServingPhase};
use adsched_server::store::{
    AdEventStore, ClientState, CreativeAdStore, MemoryStore, RecordingDelivery, SqliteStore,
    StaticSegments, StoreResult,
};
use adsched_server::{install, AdRng, EngineConfig, Services};
use adsched_testing::{creative_ad, monday_morning};
use chrono::{DateTime, Utc};
use common::Harness;
use tokio::sync::watch;

fn harness(config: EngineConfig) -> Harness {
    Harness::new(config, Arc::new(TokioClock::new(monday_morning())))
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_across_cycles() {
    let harness = harness(EngineConfig::default());
    let ads: Vec<_> = (0..3).map(|_| creative_ad("untargeted")).collect();
    harness.store.save(&ads);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = harness.runner.spawn(shutdown_rx);
    let serving = harness.context.get::<AdServing>();
    serving.start_serving_ads_at_regular_intervals();

    // Deliveries at 120s, 1921s and 3722s: two per hour, no retries.
    tokio::time::sleep(Duration::from_secs(3723)).await;

    let delivered = harness.delivery.delivered();
    assert_eq!(delivered.len(), 3);
    let distinct: HashSet<_> = delivered.iter().map(|ad| ad.creative_instance_id).collect();
    assert_eq!(distinct.len(), 3);

    serving.stop_serving_ads_at_regular_intervals();
    let _ = shutdown_tx.send(true);
    driver.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_no_ads_backs_off_two_minutes() {
    let harness = harness(EngineConfig::default());
    let serving = harness.context.get::<AdServing>();

    let result = serving.maybe_serve_ad();
    harness.runner.run_until_idle();

    assert_eq!(result.peek(), Some(None));
    assert_eq!(serving.state(), ServingPhase::TimerScheduled);
    assert_eq!(
        serving.next_serving_interval(),
        Some(harness.clock.now() + chrono::Duration::seconds(120))
    );
}

#[tokio::test(start_paused = true)]
async fn test_success_interval_follows_ads_per_hour() {
    let mut config = EngineConfig::default();
    config.frequency_caps.ads_per_hour = 4;
    let harness = harness(config);
    harness.store.save(&[creative_ad("untargeted")]);
    let serving = harness.context.get::<AdServing>();

    let result = serving.maybe_serve_ad();
    harness.runner.run_until_idle();

    assert!(result.peek().flatten().is_some());
    assert_eq!(
        serving.next_serving_interval(),
        Some(harness.clock.now() + chrono::Duration::seconds(901))
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_in_flight_cycle() {
    let harness = harness(EngineConfig::default());
    harness.store.save(&[creative_ad("untargeted")]);
    let serving = harness.context.get::<AdServing>();

    serving.start_serving_ads_at_regular_intervals();
    tokio::time::sleep(Duration::from_secs(121)).await;

    // The timer has posted the cycle but the runner has not run it yet.
    harness.runner.run_until_idle();
    assert_eq!(harness.delivery.delivered().len(), 1);

    let result = serving.maybe_serve_ad();
    serving.stop_serving_ads_at_regular_intervals();
    harness.runner.run_until_idle();

    assert_eq!(result.peek(), Some(None));
    assert_eq!(harness.delivery.delivered().len(), 1);
    assert_eq!(serving.state(), ServingPhase::Idle);

    tokio::time::sleep(Duration::from_secs(7200)).await;
    harness.runner.run_until_idle();
    assert_eq!(harness.delivery.delivered().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_schedule_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ads.db");
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new(monday_morning()));
    let ad = creative_ad("untargeted");

    let start = |runner: &TaskRunner, delivery: Arc<RecordingDelivery>| {
        let store = Arc::new(SqliteStore::open(&path, runner).unwrap().with_clock(clock.clone()));
        let context = Context::new(runner.clone());
        let services = Services {
            creative_ads: store.clone(),
            ad_events: store.clone(),
            browsing_history: store.clone(),
            client_state: store.clone(),
            delivery,
            segments: Arc::new(StaticSegments::default()),
            clock: clock.clone(),
            rng: Arc::new(AdRng::seeded(3)),
        };
        install(&context, services, EngineConfig::default()).unwrap();
        (context, store)
    };

    let first_runner = TaskRunner::new("first");
    let first_delivery = Arc::new(RecordingDelivery::new());
    let (first, store) = start(&first_runner, first_delivery.clone());
    store.save(&[ad.clone()]);

    let serving = first.get::<AdServing>();
    serving.maybe_serve_ad();
    first_runner.run_until_idle();
    assert_eq!(first_delivery.delivered().len(), 1);
    let next = store.next_serving_interval().unwrap();
    serving.stop_serving_ads_at_regular_intervals();
    drop(serving);
    drop(first);
    drop(store);

    let second_runner = TaskRunner::new("second");
    let second_delivery = Arc::new(RecordingDelivery::new());
    let (second, store) = start(&second_runner, second_delivery.clone());
    assert_eq!(store.next_serving_interval(), Some(next));
    assert_eq!(store.get_all().peek().unwrap().unwrap().len(), 1);
    assert!(store.seen_ads().contains_key(&ad.creative_instance_id));

    let serving = second.get::<AdServing>();
    serving.start_serving_ads_at_regular_intervals();

    tokio::time::sleep(Duration::from_secs(1799)).await;
    second_runner.run_until_idle();
    assert!(second_delivery.delivered().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    second_runner.run_until_idle();
    assert_eq!(second_delivery.delivered().len(), 1);
}

/// A catalog whose lookups are dropped without an answer.
struct UnansweredCatalog {
    runner: TaskRunner,
    store: Arc<MemoryStore>,
}

impl CreativeAdStore for UnansweredCatalog {
    fn get_for_segments(
        &self,
        _segments: &[String],
        _now: DateTime<Utc>,
    ) -> StoreResult<Vec<CreativeAd>> {
        Resolver::new(&self.runner).result()
    }

    fn get_for_creative_instance_id(&self, id: CreativeInstanceId) -> StoreResult<CreativeAd> {
        self.store.get_for_creative_instance_id(id)
    }

    fn save(&self, ads: &[CreativeAd]) -> StoreResult<()> {
        self.store.save(ads)
    }

    fn delete_all(&self) -> StoreResult<()> {
        self.store.delete_all()
    }
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_evaluation_counts_as_failure() {
    let runner = TaskRunner::new("abandoned");
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new(monday_morning()));
    let store = Arc::new(MemoryStore::with_clock(&runner, clock.clone()));
    let context = Context::new(runner.clone());
    let mut services = Services::memory(
        store.clone(),
        Arc::new(RecordingDelivery::new()),
        Arc::new(StaticSegments::default()),
        clock.clone(),
        Arc::new(AdRng::seeded(5)),
    );
    services.creative_ads = Arc::new(UnansweredCatalog {
        runner: runner.clone(),
        store: store.clone(),
    });
    install(&context, services, EngineConfig::default()).unwrap();
    let serving = context.get::<AdServing>();

    let first = serving.maybe_serve_ad();
    runner.run_until_idle();

    assert_eq!(first.peek(), Some(None));
    assert_eq!(context.job_count(), 0);
    assert_eq!(serving.state(), ServingPhase::TimerScheduled);
    assert_eq!(
        store.next_serving_interval(),
        Some(clock.now() + chrono::Duration::seconds(120))
    );

    let second = serving.maybe_serve_ad();
    runner.run_until_idle();
    assert_eq!(second.peek(), Some(None));
    assert_eq!(context.job_count(), 0);
}
