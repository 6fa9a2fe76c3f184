//! Collaborators the engine reads from and writes to.
//!
//! Data access goes through `AsyncResult`s so a slow backend never blocks
//! the serving runner. Client state is synchronous: it is small, cached in
//! memory, and written through.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: everything in memory, for tests and embedding
//! - [`SqliteStore`]: durable storage on `rusqlite`

use std::collections::HashMap;

use adsched_async::AsyncResult;
use adsched_events::{AdEvent, AdNotification, CreativeAd};
use adsched_id::{AdvertiserId, CreativeInstanceId};
use chrono::{DateTime, Utc};
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::{MemoryStore, RecordingDelivery, StaticSegments};
pub use sqlite::SqliteStore;

/// Creative ads are upserted in batches of this many rows.
pub const SAVE_BATCH_SIZE: usize = 50;

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Invalid(e.to_string())
    }
}

pub type StoreResult<T> = AsyncResult<Result<T, StoreError>>;

/// The creative ad catalog.
pub trait CreativeAdStore: Send + Sync {
    /// Ads in flight at `now` whose segment matches one of `segments`,
    /// compared case-insensitively.
    fn get_for_segments(&self, segments: &[String], now: DateTime<Utc>) -> StoreResult<Vec<CreativeAd>>;

    fn get_for_creative_instance_id(&self, id: CreativeInstanceId) -> StoreResult<CreativeAd>;

    /// Insert or replace ads, in batches of [`SAVE_BATCH_SIZE`].
    fn save(&self, ads: &[CreativeAd]) -> StoreResult<()>;

    fn delete_all(&self) -> StoreResult<()>;
}

/// The append-only ad event log.
pub trait AdEventStore: Send + Sync {
    fn get_all(&self) -> StoreResult<Vec<AdEvent>>;

    fn append(&self, event: &AdEvent) -> StoreResult<()>;

    /// Delete events created before `cutoff`. Returns how many were removed.
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

/// Recently visited sites.
pub trait BrowsingHistory: Send + Sync {
    /// Up to `max_count` visited URLs from the last `days_ago` days, most
    /// recent first.
    fn get(&self, max_count: usize, days_ago: u32) -> StoreResult<Vec<String>>;
}

/// Per-user serving state that outlives a cycle.
pub trait ClientState: Send + Sync {
    /// Creative instances shown since the last round robin reset, with how
    /// many times each was shown.
    fn seen_ads(&self) -> HashMap<CreativeInstanceId, u64>;

    fn mark_ad_seen(&self, id: CreativeInstanceId) -> Result<(), StoreError>;

    /// Forget the given ads, starting a new round for that pool.
    fn reset_seen_ads(&self, ids: &[CreativeInstanceId]) -> Result<(), StoreError>;

    fn seen_advertisers(&self) -> HashMap<AdvertiserId, u64>;

    fn mark_advertiser_seen(&self, id: AdvertiserId) -> Result<(), StoreError>;

    fn reset_seen_advertisers(&self, ids: &[AdvertiserId]) -> Result<(), StoreError>;

    fn next_serving_interval(&self) -> Option<DateTime<Utc>>;

    fn set_next_serving_interval(&self, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Presents an ad to the user.
pub trait AdDelivery: Send + Sync {
    /// Returns false if the ad could not be shown.
    fn maybe_deliver_ad(&self, ad: &AdNotification) -> bool;
}

/// Receives a serving opportunity for the user's segments whenever a cycle
/// passes the permission gate. Optional; provide it to the context to
/// collect opportunity counts.
pub trait AdOpportunityRecorder: Send + Sync {
    fn record_ad_opportunity(&self, segments: &[String]);
}

/// The user's current interest segments.
pub trait SegmentSource: Send + Sync {
    fn segments(&self) -> Vec<String>;
}
