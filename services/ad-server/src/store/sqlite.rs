//! SQLite-backed stores.
//!
//! Creative ads are stored as JSON alongside the columns queries filter
//! on. Client state is loaded into memory at open and written through on
//! every change.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use adsched_async::{AsyncResult, Clock, SystemClock, TaskRunner};
use adsched_events::{AdEvent, CreativeAd};
use adsched_id::{AdUuid, AdvertiserId, CampaignId, CreativeInstanceId, CreativeSetId};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{
    AdEventStore, BrowsingHistory, ClientState, CreativeAdStore, StoreError, StoreResult,
    SAVE_BATCH_SIZE,
};

/// Schema version written to `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

const SEEN_ADS_KEY: &str = "seen_ads";
const SEEN_ADVERTISERS_KEY: &str = "seen_advertisers";
const NEXT_SERVING_INTERVAL_KEY: &str = "next_serving_interval";

#[derive(Default)]
struct ClientCache {
    seen_ads: HashMap<CreativeInstanceId, u64>,
    seen_advertisers: HashMap<AdvertiserId, u64>,
    next_serving_interval: Option<DateTime<Utc>>,
}

/// SQLite store for the catalog, the event log, browsing history, and
/// client state.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    client: Mutex<ClientCache>,
    runner: TaskRunner,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, runner: &TaskRunner) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn, runner)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(runner: &TaskRunner) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, runner)
    }

    /// Replace the clock used for browsing history windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn from_connection(conn: Connection, runner: &TaskRunner) -> Result<Self, StoreError> {
        migrate(&conn)?;
        let client = load_client_cache(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            client: Mutex::new(client),
            runner: runner.clone(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Record a page visit.
    pub fn add_history(&self, url: &str, visited_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO browsing_history (url, visited_at) VALUES (?1, ?2)",
            params![url, visited_at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> MutexGuard<'_, ClientCache> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready<T: Clone + Send + 'static>(&self, value: T) -> AsyncResult<T> {
        AsyncResult::ready(&self.runner, value)
    }

    fn query_segments(&self, segments: &[String], now: DateTime<Utc>) -> Result<Vec<CreativeAd>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT data FROM creative_ads
            WHERE segment = ?1 COLLATE NOCASE AND start_at <= ?2 AND end_at >= ?2
            ORDER BY rowid
            "#,
        )?;

        let mut ads: Vec<CreativeAd> = Vec::new();
        for segment in segments {
            let rows = stmt.query_map(params![segment, now.timestamp_millis()], |row| {
                row.get::<_, String>(0)
            })?;
            for data in rows {
                let ad: CreativeAd = serde_json::from_str(&data?)?;
                if !ads
                    .iter()
                    .any(|a| a.creative_instance_id == ad.creative_instance_id)
                {
                    ads.push(ad);
                }
            }
        }
        Ok(ads)
    }

    fn query_creative(&self, id: CreativeInstanceId) -> Result<CreativeAd, StoreError> {
        let data: Option<String> = self
            .conn()
            .query_row(
                "SELECT data FROM creative_ads WHERE creative_instance_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let data = data.ok_or_else(|| StoreError::NotFound(format!("creative instance {id}")))?;
        Ok(serde_json::from_str(&data)?)
    }

    fn insert_creatives(&self, ads: &[CreativeAd]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        for batch in ads.chunks(SAVE_BATCH_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    r#"
                    INSERT OR REPLACE INTO creative_ads
                        (creative_instance_id, creative_set_id, campaign_id, advertiser_id,
                         segment, start_at, end_at, data)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )?;
                for ad in batch {
                    stmt.execute(params![
                        ad.creative_instance_id.to_string(),
                        ad.creative_set_id.to_string(),
                        ad.campaign_id.to_string(),
                        ad.advertiser_id.to_string(),
                        ad.segment.to_ascii_lowercase(),
                        ad.start_at.timestamp_millis(),
                        ad.end_at.timestamp_millis(),
                        serde_json::to_string(ad)?,
                    ])?;
                }
            }
            tx.commit()?;
            debug!(count = batch.len(), "Saved creative ad batch");
        }
        Ok(())
    }

    fn query_events(&self) -> Result<Vec<AdEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT ad_uuid, creative_instance_id, creative_set_id, campaign_id,
                   advertiser_id, ad_type, confirmation_type, created_at
            FROM ad_events
            ORDER BY created_at, id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EventRow {
                ad_uuid: row.get(0)?,
                creative_instance_id: row.get(1)?,
                creative_set_id: row.get(2)?,
                campaign_id: row.get(3)?,
                advertiser_id: row.get(4)?,
                ad_type: row.get(5)?,
                confirmation_type: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    }

    fn insert_event(&self, event: &AdEvent) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO ad_events
                (ad_uuid, creative_instance_id, creative_set_id, campaign_id,
                 advertiser_id, ad_type, confirmation_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                event.ad_uuid.to_string(),
                event.creative_instance_id.to_string(),
                event.creative_set_id.to_string(),
                event.campaign_id.to_string(),
                event.advertiser_id.to_string(),
                event.ad_type.as_str(),
                event.confirmation_type.as_str(),
                event.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn query_history(&self, max_count: usize, days_ago: u32) -> Result<Vec<String>, StoreError> {
        let cutoff = self.clock.now() - Duration::days(i64::from(days_ago));
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT url FROM browsing_history
            WHERE visited_at >= ?1
            ORDER BY visited_at DESC
            LIMIT ?2
            "#,
        )?;
        let limit = i64::try_from(max_count).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![cutoff.timestamp_millis(), limit], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn write_client_value<V: Serialize>(&self, key: &str, value: &V) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO client_state (key, value) VALUES (?1, ?2)",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }
}

/// Create or upgrade the schema according to `PRAGMA user_version`.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Invalid(format!(
            "schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    if version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS creative_ads (
                creative_instance_id TEXT PRIMARY KEY,
                creative_set_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                advertiser_id TEXT NOT NULL,
                segment TEXT NOT NULL,
                start_at INTEGER NOT NULL,
                end_at INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_creative_ads_segment
                ON creative_ads(segment);

            CREATE TABLE IF NOT EXISTS ad_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ad_uuid TEXT NOT NULL,
                creative_instance_id TEXT NOT NULL,
                creative_set_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                advertiser_id TEXT NOT NULL,
                ad_type TEXT NOT NULL,
                confirmation_type TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ad_events_created_at
                ON ad_events(created_at);

            CREATE TABLE IF NOT EXISTS browsing_history (
                url TEXT NOT NULL,
                visited_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS client_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
    }

    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!(from = version, to = SCHEMA_VERSION, "Migrated ad store schema");
    }
    Ok(())
}

fn load_client_cache(conn: &Connection) -> Result<ClientCache, StoreError> {
    fn read<V: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<V>, StoreError> {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM client_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|v| serde_json::from_str(&v).map_err(StoreError::from))
            .transpose()
    }

    Ok(ClientCache {
        seen_ads: read(conn, SEEN_ADS_KEY)?.unwrap_or_default(),
        seen_advertisers: read(conn, SEEN_ADVERTISERS_KEY)?.unwrap_or_default(),
        next_serving_interval: read(conn, NEXT_SERVING_INTERVAL_KEY)?,
    })
}

struct EventRow {
    ad_uuid: String,
    creative_instance_id: String,
    creative_set_id: String,
    campaign_id: String,
    advertiser_id: String,
    ad_type: String,
    confirmation_type: String,
    created_at: i64,
}

impl EventRow {
    fn into_event(self) -> Result<AdEvent, StoreError> {
        let invalid = |e: &dyn std::fmt::Display| StoreError::Invalid(e.to_string());
        Ok(AdEvent {
            ad_uuid: AdUuid::parse(&self.ad_uuid).map_err(|e| invalid(&e))?,
            creative_instance_id: CreativeInstanceId::parse(&self.creative_instance_id)
                .map_err(|e| invalid(&e))?,
            creative_set_id: CreativeSetId::parse(&self.creative_set_id).map_err(|e| invalid(&e))?,
            campaign_id: CampaignId::parse(&self.campaign_id).map_err(|e| invalid(&e))?,
            advertiser_id: AdvertiserId::parse(&self.advertiser_id).map_err(|e| invalid(&e))?,
            ad_type: self.ad_type.parse().map_err(|e| invalid(&e))?,
            confirmation_type: self.confirmation_type.parse().map_err(|e| invalid(&e))?,
            created_at: DateTime::from_timestamp_millis(self.created_at).ok_or_else(|| {
                StoreError::Invalid(format!("timestamp {} out of range", self.created_at))
            })?,
        })
    }
}

impl CreativeAdStore for SqliteStore {
    fn get_for_segments(&self, segments: &[String], now: DateTime<Utc>) -> StoreResult<Vec<CreativeAd>> {
        self.ready(self.query_segments(segments, now))
    }

    fn get_for_creative_instance_id(&self, id: CreativeInstanceId) -> StoreResult<CreativeAd> {
        self.ready(self.query_creative(id))
    }

    fn save(&self, ads: &[CreativeAd]) -> StoreResult<()> {
        self.ready(self.insert_creatives(ads))
    }

    fn delete_all(&self) -> StoreResult<()> {
        let result = self
            .conn()
            .execute("DELETE FROM creative_ads", [])
            .map(|_| ())
            .map_err(StoreError::from);
        self.ready(result)
    }
}

impl AdEventStore for SqliteStore {
    fn get_all(&self) -> StoreResult<Vec<AdEvent>> {
        self.ready(self.query_events())
    }

    fn append(&self, event: &AdEvent) -> StoreResult<()> {
        self.ready(self.insert_event(event))
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let result = self
            .conn()
            .execute(
                "DELETE FROM ad_events WHERE created_at < ?1",
                params![cutoff.timestamp_millis()],
            )
            .map_err(StoreError::from);
        self.ready(result)
    }
}

impl BrowsingHistory for SqliteStore {
    fn get(&self, max_count: usize, days_ago: u32) -> StoreResult<Vec<String>> {
        self.ready(self.query_history(max_count, days_ago))
    }
}

impl ClientState for SqliteStore {
    fn seen_ads(&self) -> HashMap<CreativeInstanceId, u64> {
        self.client().seen_ads.clone()
    }

    fn mark_ad_seen(&self, id: CreativeInstanceId) -> Result<(), StoreError> {
        let mut client = self.client();
        *client.seen_ads.entry(id).or_insert(0) += 1;
        self.write_client_value(SEEN_ADS_KEY, &client.seen_ads)
    }

    fn reset_seen_ads(&self, ids: &[CreativeInstanceId]) -> Result<(), StoreError> {
        let mut client = self.client();
        for id in ids {
            client.seen_ads.remove(id);
        }
        self.write_client_value(SEEN_ADS_KEY, &client.seen_ads)
    }

    fn seen_advertisers(&self) -> HashMap<AdvertiserId, u64> {
        self.client().seen_advertisers.clone()
    }

    fn mark_advertiser_seen(&self, id: AdvertiserId) -> Result<(), StoreError> {
        let mut client = self.client();
        *client.seen_advertisers.entry(id).or_insert(0) += 1;
        self.write_client_value(SEEN_ADVERTISERS_KEY, &client.seen_advertisers)
    }

    fn reset_seen_advertisers(&self, ids: &[AdvertiserId]) -> Result<(), StoreError> {
        let mut client = self.client();
        for id in ids {
            client.seen_advertisers.remove(id);
        }
        self.write_client_value(SEEN_ADVERTISERS_KEY, &client.seen_advertisers)
    }

    fn next_serving_interval(&self) -> Option<DateTime<Utc>> {
        self.client().next_serving_interval
    }

    fn set_next_serving_interval(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut client = self.client();
        client.next_serving_interval = Some(at);
        self.write_client_value(NEXT_SERVING_INTERVAL_KEY, &at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsched_async::ManualClock;
    use adsched_events::ConfirmationType;
    use adsched_testing::{creative_ad, monday_morning, served, AdEventBuilder, CreativeAdBuilder};

    fn runner() -> TaskRunner {
        TaskRunner::new("sqlite")
    }

    #[test]
    fn test_schema_version_is_set() {
        let store = SqliteStore::open_in_memory(&runner()).unwrap();
        let version: i64 = store
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_creative_ads_by_segment() {
        let store = SqliteStore::open_in_memory(&runner()).unwrap();
        let now = monday_morning();
        let software = creative_ad("Technology & Computing-Software");
        let travel = creative_ad("travel");
        let expired = CreativeAdBuilder::new("travel")
            .flight(now - Duration::days(30), now - Duration::days(1))
            .build();
        store.save(&[software.clone(), travel.clone(), expired]).peek().unwrap().unwrap();

        let found = store
            .get_for_segments(
                &["technology & computing-software".to_string(), "travel".to_string()],
                now,
            )
            .peek()
            .unwrap()
            .unwrap();
        assert_eq!(found, vec![software.clone(), travel]);

        let by_id = store
            .get_for_creative_instance_id(software.creative_instance_id)
            .peek()
            .unwrap()
            .unwrap();
        assert_eq!(by_id, software);
    }

    #[test]
    fn test_save_spans_batches() {
        let store = SqliteStore::open_in_memory(&runner()).unwrap();
        let ads: Vec<_> = (0..SAVE_BATCH_SIZE * 2 + 7).map(|_| creative_ad("bulk")).collect();
        store.save(&ads).peek().unwrap().unwrap();

        let found = store
            .get_for_segments(&["bulk".to_string()], monday_morning())
            .peek()
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), ads.len());

        store.delete_all().peek().unwrap().unwrap();
        let found = store
            .get_for_segments(&["bulk".to_string()], monday_morning())
            .peek()
            .unwrap()
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_ad_events_roundtrip_and_purge() {
        let store = SqliteStore::open_in_memory(&runner()).unwrap();
        let ad = creative_ad("travel");
        let now = monday_morning();
        let old = served(&ad, now - Duration::days(120));
        let recent = AdEventBuilder::for_creative(&ad, ConfirmationType::Viewed)
            .at(now)
            .build();

        store.append(&old).peek().unwrap().unwrap();
        store.append(&recent).peek().unwrap().unwrap();
        assert_eq!(
            store.get_all().peek().unwrap().unwrap(),
            vec![old.clone(), recent.clone()]
        );

        let purged = store
            .purge_older_than(now - Duration::days(90))
            .peek()
            .unwrap()
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.get_all().peek().unwrap().unwrap(), vec![recent]);
    }

    #[test]
    fn test_browsing_history_window() {
        let clock = Arc::new(ManualClock::new(monday_morning()));
        let store = SqliteStore::open_in_memory(&runner())
            .unwrap()
            .with_clock(clock);
        let now = monday_morning();
        store.add_history("https://stale.example.com", now - Duration::days(31)).unwrap();
        store.add_history("https://older.example.com", now - Duration::days(2)).unwrap();
        store.add_history("https://newer.example.com", now - Duration::days(1)).unwrap();

        assert_eq!(
            BrowsingHistory::get(&store, 10, 30).peek().unwrap().unwrap(),
            vec!["https://newer.example.com", "https://older.example.com"]
        );
    }

    #[test]
    fn test_browsing_history_failure_is_an_error() {
        let store = SqliteStore::open_in_memory(&runner()).unwrap();
        store.conn().execute_batch("DROP TABLE browsing_history").unwrap();

        assert!(matches!(
            BrowsingHistory::get(&store, 10, 30).peek().unwrap(),
            Err(StoreError::Database(_))
        ));
    }

    #[test]
    fn test_client_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ads.db");
        let ad = creative_ad("travel");
        let next = monday_morning() + Duration::minutes(2);

        {
            let store = SqliteStore::open(&path, &runner()).unwrap();
            store.mark_ad_seen(ad.creative_instance_id).unwrap();
            store.mark_advertiser_seen(ad.advertiser_id).unwrap();
            store.set_next_serving_interval(next).unwrap();
        }

        let store = SqliteStore::open(&path, &runner()).unwrap();
        assert_eq!(store.seen_ads().get(&ad.creative_instance_id), Some(&1));
        assert_eq!(store.seen_advertisers().get(&ad.advertiser_id), Some(&1));
        assert_eq!(store.next_serving_interval(), Some(next));

        store.reset_seen_ads(&[ad.creative_instance_id]).unwrap();
        drop(store);
        let store = SqliteStore::open(&path, &runner()).unwrap();
        assert!(store.seen_ads().is_empty());
    }
}
