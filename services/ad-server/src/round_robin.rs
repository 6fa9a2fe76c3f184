//! Round robin over seen ads and advertisers.
//!
//! Ads and advertisers already shown are filtered out of a pool until the
//! filter would leave nothing. At that point the pool's seen entries are
//! reset and the whole pool is eligible again, so every member is shown
//! once before any repeats.

use std::collections::HashSet;

use adsched_events::CreativeAd;
use adsched_id::{AdvertiserId, CreativeInstanceId};
use tracing::{debug, warn};

use crate::store::ClientState;

/// Drop ads from advertisers already seen, resetting the pool's advertisers
/// once all of them have been seen.
pub fn filter_seen_advertisers_and_round_robin_if_needed(
    ads: Vec<CreativeAd>,
    client: &dyn ClientState,
) -> Vec<CreativeAd> {
    let seen = client.seen_advertisers();
    let unseen: Vec<_> = ads
        .iter()
        .filter(|ad| !seen.contains_key(&ad.advertiser_id))
        .cloned()
        .collect();
    if !unseen.is_empty() || ads.is_empty() {
        return unseen;
    }

    let pool: Vec<AdvertiserId> = unique(ads.iter().map(|ad| ad.advertiser_id));
    if let Err(e) = client.reset_seen_advertisers(&pool) {
        warn!(error = %e, "Failed to reset seen advertisers");
    }
    debug!(advertisers = pool.len(), "All advertisers seen, starting new round");
    ads
}

/// Drop ads already seen, resetting the pool once all of them have been
/// seen.
pub fn filter_seen_ads_and_round_robin_if_needed(
    ads: Vec<CreativeAd>,
    client: &dyn ClientState,
) -> Vec<CreativeAd> {
    let seen = client.seen_ads();
    let unseen: Vec<_> = ads
        .iter()
        .filter(|ad| !seen.contains_key(&ad.creative_instance_id))
        .cloned()
        .collect();
    if !unseen.is_empty() || ads.is_empty() {
        return unseen;
    }

    let pool: Vec<CreativeInstanceId> = unique(ads.iter().map(|ad| ad.creative_instance_id));
    if let Err(e) = client.reset_seen_ads(&pool) {
        warn!(error = %e, "Failed to reset seen ads");
    }
    debug!(ads = pool.len(), "All ads seen, starting new round");
    ads
}

fn unique<T: Copy + Eq + std::hash::Hash>(ids: impl Iterator<Item = T>) -> Vec<T> {
    let mut set = HashSet::new();
    ids.filter(|id| set.insert(*id)).collect()
}
