//! Prioritization: only the best priority tier is offered.

use adsched_events::CreativeAd;
use tracing::debug;

/// Keep the ads with the lowest non-zero priority. Ads with priority zero
/// are dropped.
pub fn prioritize_ads(ads: Vec<CreativeAd>) -> Vec<CreativeAd> {
    let Some(top) = ads.iter().map(|ad| ad.priority).filter(|&p| p > 0).min() else {
        if !ads.is_empty() {
            debug!(count = ads.len(), "No prioritized ads");
        }
        return Vec::new();
    };

    ads.into_iter()
        .filter(|ad| {
            let keep = ad.priority == top;
            if !keep {
                debug!(
                    creative_instance_id = %ad.creative_instance_id,
                    priority = ad.priority,
                    top,
                    "Deprioritized ad"
                );
            }
            keep
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsched_testing::CreativeAdBuilder;
    use rstest::rstest;

    fn with_priorities(priorities: &[u32]) -> Vec<CreativeAd> {
        priorities
            .iter()
            .map(|&p| CreativeAdBuilder::new("travel").priority(p).build())
            .collect()
    }

    #[rstest]
    #[case::single_tier(&[1, 1, 1], &[1, 1, 1])]
    #[case::lowest_wins(&[3, 1, 2, 1], &[1, 1])]
    #[case::zero_is_dropped(&[0, 2, 0], &[2])]
    #[case::only_zero(&[0, 0], &[])]
    #[case::empty(&[], &[])]
    fn test_prioritize(#[case] input: &[u32], #[case] expected: &[u32]) {
        let kept: Vec<_> = prioritize_ads(with_priorities(input))
            .iter()
            .map(|ad| ad.priority)
            .collect();
        assert_eq!(kept, expected);
    }
}
