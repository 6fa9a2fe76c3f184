//! In-memory stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use adsched_async::{AsyncResult, Clock, SystemClock, TaskRunner};
use adsched_events::{AdEvent, AdNotification, CreativeAd};
use adsched_id::{AdvertiserId, CreativeInstanceId};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::{
    AdDelivery, AdEventStore, BrowsingHistory, ClientState, CreativeAdStore, SegmentSource,
    StoreError, StoreResult,
};

#[derive(Default)]
struct Tables {
    creative_ads: Vec<CreativeAd>,
    ad_events: Vec<AdEvent>,
    history: Vec<(String, DateTime<Utc>)>,
    seen_ads: HashMap<CreativeInstanceId, u64>,
    seen_advertisers: HashMap<AdvertiserId, u64>,
    next_serving_interval: Option<DateTime<Utc>>,
}

/// Every store trait, backed by process memory.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    runner: TaskRunner,
    clock: Arc<dyn Clock>,
    failing: AtomicBool,
    history_failing: AtomicBool,
}

impl MemoryStore {
    pub fn new(runner: &TaskRunner) -> Self {
        Self::with_clock(runner, Arc::new(SystemClock))
    }

    pub fn with_clock(runner: &TaskRunner, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            runner: runner.clone(),
            clock,
            failing: AtomicBool::new(false),
            history_failing: AtomicBool::new(false),
        }
    }

    /// Make every catalog and event read fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make browsing history reads fail until cleared.
    pub fn set_history_failing(&self, failing: bool) {
        self.history_failing.store(failing, Ordering::SeqCst);
    }

    pub fn add_history(&self, url: &str, visited_at: DateTime<Utc>) {
        self.tables().history.push((url.to_string(), visited_at));
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<AdEvent> {
        self.tables().ad_events.clone()
    }

    pub fn insert_events(&self, events: impl IntoIterator<Item = AdEvent>) {
        self.tables().ad_events.extend(events);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready<T: Clone + Send + 'static>(&self, value: T) -> AsyncResult<T> {
        AsyncResult::ready(&self.runner, value)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".to_string()));
        }
        Ok(())
    }
}

impl CreativeAdStore for MemoryStore {
    fn get_for_segments(&self, segments: &[String], now: DateTime<Utc>) -> StoreResult<Vec<CreativeAd>> {
        let result = self.check_available().map(|()| {
            self.tables()
                .creative_ads
                .iter()
                .filter(|ad| ad.is_active_at(now))
                .filter(|ad| segments.iter().any(|s| ad.matches_segment(s)))
                .cloned()
                .collect()
        });
        self.ready(result)
    }

    fn get_for_creative_instance_id(&self, id: CreativeInstanceId) -> StoreResult<CreativeAd> {
        let result = self.check_available().and_then(|()| {
            self.tables()
                .creative_ads
                .iter()
                .find(|ad| ad.creative_instance_id == id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("creative instance {id}")))
        });
        self.ready(result)
    }

    fn save(&self, ads: &[CreativeAd]) -> StoreResult<()> {
        let mut tables = self.tables();
        for ad in ads {
            match tables
                .creative_ads
                .iter()
                .position(|existing| existing.creative_instance_id == ad.creative_instance_id)
            {
                Some(index) => tables.creative_ads[index] = ad.clone(),
                None => tables.creative_ads.push(ad.clone()),
            }
        }
        debug!(count = ads.len(), "Saved creative ads");
        drop(tables);
        self.ready(Ok(()))
    }

    fn delete_all(&self) -> StoreResult<()> {
        self.tables().creative_ads.clear();
        self.ready(Ok(()))
    }
}

impl AdEventStore for MemoryStore {
    fn get_all(&self) -> StoreResult<Vec<AdEvent>> {
        let result = self
            .check_available()
            .map(|()| self.tables().ad_events.clone());
        self.ready(result)
    }

    fn append(&self, event: &AdEvent) -> StoreResult<()> {
        self.tables().ad_events.push(event.clone());
        self.ready(Ok(()))
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut tables = self.tables();
        let before = tables.ad_events.len();
        tables.ad_events.retain(|event| event.created_at >= cutoff);
        let purged = before - tables.ad_events.len();
        drop(tables);
        self.ready(Ok(purged))
    }
}

impl BrowsingHistory for MemoryStore {
    fn get(&self, max_count: usize, days_ago: u32) -> StoreResult<Vec<String>> {
        if self.history_failing.load(Ordering::SeqCst) {
            return self.ready(Err(StoreError::Unavailable(
                "memory history set to fail".to_string(),
            )));
        }
        let cutoff = self.clock.now() - Duration::days(i64::from(days_ago));
        let mut visits: Vec<_> = self
            .tables()
            .history
            .iter()
            .filter(|(_, visited_at)| *visited_at >= cutoff)
            .cloned()
            .collect();
        visits.sort_by(|a, b| b.1.cmp(&a.1));
        let urls = visits
            .into_iter()
            .take(max_count)
            .map(|(url, _)| url)
            .collect();
        self.ready(Ok(urls))
    }
}

impl ClientState for MemoryStore {
    fn seen_ads(&self) -> HashMap<CreativeInstanceId, u64> {
        self.tables().seen_ads.clone()
    }

    fn mark_ad_seen(&self, id: CreativeInstanceId) -> Result<(), StoreError> {
        *self.tables().seen_ads.entry(id).or_insert(0) += 1;
        Ok(())
    }

    fn reset_seen_ads(&self, ids: &[CreativeInstanceId]) -> Result<(), StoreError> {
        let mut tables = self.tables();
        for id in ids {
            tables.seen_ads.remove(id);
        }
        Ok(())
    }

    fn seen_advertisers(&self) -> HashMap<AdvertiserId, u64> {
        self.tables().seen_advertisers.clone()
    }

    fn mark_advertiser_seen(&self, id: AdvertiserId) -> Result<(), StoreError> {
        *self.tables().seen_advertisers.entry(id).or_insert(0) += 1;
        Ok(())
    }

    fn reset_seen_advertisers(&self, ids: &[AdvertiserId]) -> Result<(), StoreError> {
        let mut tables = self.tables();
        for id in ids {
            tables.seen_advertisers.remove(id);
        }
        Ok(())
    }

    fn next_serving_interval(&self) -> Option<DateTime<Utc>> {
        self.tables().next_serving_interval
    }

    fn set_next_serving_interval(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.tables().next_serving_interval = Some(at);
        Ok(())
    }
}

/// Delivery that records ads instead of showing them.
#[derive(Debug)]
pub struct RecordingDelivery {
    delivered: Mutex<Vec<AdNotification>>,
    accept: AtomicBool,
}

impl Default for RecordingDelivery {
    fn default() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
        }
    }
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether later deliveries succeed.
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<AdNotification> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AdDelivery for RecordingDelivery {
    fn maybe_deliver_ad(&self, ad: &AdNotification) -> bool {
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ad.clone());
        true
    }
}

/// A fixed, replaceable segment list.
#[derive(Debug, Default)]
pub struct StaticSegments {
    segments: Mutex<Vec<String>>,
}

impl StaticSegments {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: Mutex::new(segments.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set<S: Into<String>>(&self, segments: impl IntoIterator<Item = S>) {
        *self.segments.lock().unwrap_or_else(PoisonError::into_inner) =
            segments.into_iter().map(Into::into).collect();
    }
}

impl SegmentSource for StaticSegments {
    fn segments(&self) -> Vec<String> {
        self.segments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsched_async::ManualClock;
    use adsched_testing::{creative_ad, monday_morning, CreativeAdBuilder};

    fn store() -> (TaskRunner, MemoryStore) {
        let runner = TaskRunner::new("store");
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let store = MemoryStore::with_clock(&runner, clock);
        (runner, store)
    }

    #[test]
    fn test_segment_match_is_case_insensitive_and_in_flight_only() {
        let (_runner, store) = store();
        let now = monday_morning();
        let live = creative_ad("Technology & Computing");
        let expired = CreativeAdBuilder::new("technology & computing")
            .flight(now - Duration::days(10), now - Duration::days(1))
            .build();
        store.save(&[live.clone(), expired]);

        let found = store
            .get_for_segments(&["technology & computing".to_string()], now)
            .peek()
            .unwrap()
            .unwrap();
        assert_eq!(found, vec![live]);
    }

    #[test]
    fn test_save_replaces_by_creative_instance_id() {
        let (_runner, store) = store();
        let ad = creative_ad("travel");
        let mut updated = ad.clone();
        updated.title = "Updated".to_string();

        store.save(&[ad.clone()]);
        store.save(&[updated]);

        let found = store
            .get_for_creative_instance_id(ad.creative_instance_id)
            .peek()
            .unwrap()
            .unwrap();
        assert_eq!(found.title, "Updated");
    }

    #[test]
    fn test_missing_creative_is_not_found() {
        let (_runner, store) = store();
        let result = store
            .get_for_creative_instance_id(CreativeInstanceId::new())
            .peek()
            .unwrap();
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_history_is_bounded() {
        let (_runner, store) = store();
        let now = monday_morning();
        store.add_history("https://old.example.com", now - Duration::days(40));
        store.add_history("https://a.example.com", now - Duration::hours(2));
        store.add_history("https://b.example.com", now - Duration::hours(1));

        assert_eq!(
            BrowsingHistory::get(&store, 10, 30).peek().unwrap().unwrap(),
            vec!["https://b.example.com", "https://a.example.com"]
        );
        assert_eq!(BrowsingHistory::get(&store, 1, 30).peek().unwrap().unwrap().len(), 1);

        store.set_history_failing(true);
        assert!(matches!(
            BrowsingHistory::get(&store, 10, 30).peek().unwrap(),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_reset_only_touches_pool() {
        let (_runner, store) = store();
        let (a, b) = (CreativeInstanceId::new(), CreativeInstanceId::new());
        store.mark_ad_seen(a).unwrap();
        store.mark_ad_seen(a).unwrap();
        store.mark_ad_seen(b).unwrap();

        assert_eq!(store.seen_ads().get(&a), Some(&2));
        store.reset_seen_ads(&[a]).unwrap();

        let seen = store.seen_ads();
        assert!(!seen.contains_key(&a));
        assert!(seen.contains_key(&b));
    }

    #[test]
    fn test_failing_store_reports_unavailable() {
        let (_runner, store) = store();
        store.set_failing(true);
        assert!(matches!(
            store.get_all().peek().unwrap(),
            Err(StoreError::Unavailable(_))
        ));
    }
}
