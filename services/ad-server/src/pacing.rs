//! Pacing: probabilistic throttling by each ad's `ptr`.

use adsched_events::CreativeAd;
use rand::Rng;
use tracing::debug;

use crate::rng::AdRng;

/// Drop each ad with probability `1 - ptr`.
pub fn pace_ads(ads: Vec<CreativeAd>, rng: &AdRng) -> Vec<CreativeAd> {
    rng.with(|rng| {
        ads.into_iter()
            .filter(|ad| {
                let roll = rng.random::<f64>();
                if roll > ad.ptr {
                    debug!(
                        creative_instance_id = %ad.creative_instance_id,
                        ptr = ad.ptr,
                        "Pacing ad delivery"
                    );
                    return false;
                }
                true
            })
            .collect()
    })
}
