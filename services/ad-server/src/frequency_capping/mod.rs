//! Frequency capping.
//!
//! Two rule families run over a borrowed snapshot of the ad event log:
//!
//! - **Permission rules** gate a whole serving cycle ("may any ad of this
//!   type be shown right now?").
//! - **Exclusion rules** drop individual candidates ("has this creative
//!   been shown too often?").
//!
//! Rules never mutate the log, so their order does not affect the outcome.
//! A rule that rejects records why in `last_message`, which
//! [`FrequencyCapping`] logs at debug.

use adsched_events::{AdEvent, AdType, ConfirmationType, CreativeAd};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::FrequencyCapConfig;

mod exclusion_rules;
mod permission_rules;

pub use exclusion_rules::{
    AdUuidFrequencyCap, AntiTargetingExclusionRule, DailyCapExclusionRule, DaypartExclusionRule,
    GeoTargetExclusionRule, PerDayExclusionRule, TotalMaxExclusionRule,
};
pub use permission_rules::{AdsPerDayFrequencyCap, AdsPerHourFrequencyCap, MinimumWaitTimeFrequencyCap};

/// Decides whether a single ad must be dropped.
pub trait ExclusionRule<T: ?Sized> {
    fn should_exclude(&mut self, ad: &T) -> bool;

    /// Why the last excluded ad was excluded.
    fn last_message(&self) -> &str;
}

/// Decides whether serving may proceed at all.
pub trait PermissionRule {
    fn should_allow(&mut self) -> bool;

    /// Why the last denial happened.
    fn last_message(&self) -> &str;
}

/// True if fewer than `cap` of `history` fall within `window` before `now`.
///
/// A cap of zero is never respected.
pub fn does_history_respect_cap_for_rolling_time_constraint(
    history: &[DateTime<Utc>],
    window: Duration,
    cap: u32,
    now: DateTime<Utc>,
) -> bool {
    let since = now - window;
    let count = history.iter().filter(|at| **at >= since).count();
    (count as u64) < u64::from(cap)
}

/// Timestamps of events matching `predicate`.
pub(crate) fn timestamps_where<F>(ad_events: &[AdEvent], predicate: F) -> Vec<DateTime<Utc>>
where
    F: Fn(&AdEvent) -> bool,
{
    ad_events
        .iter()
        .filter(|event| predicate(event))
        .map(|event| event.created_at)
        .collect()
}

/// All frequency caps for one decision, over one event log snapshot.
pub struct FrequencyCapping<'a> {
    config: &'a FrequencyCapConfig,
    ad_events: &'a [AdEvent],
    history: &'a [String],
    now: DateTime<Utc>,
}

impl<'a> FrequencyCapping<'a> {
    pub fn new(
        config: &'a FrequencyCapConfig,
        ad_events: &'a [AdEvent],
        history: &'a [String],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            ad_events,
            history,
            now,
        }
    }

    /// Whether an ad notification may be served this cycle.
    pub fn is_ad_allowed(&self) -> bool {
        self.is_ad_type_allowed(AdType::AdNotification)
    }

    /// Whether an ad of `ad_type` may be shown or confirmed right now.
    pub fn is_ad_type_allowed(&self, ad_type: AdType) -> bool {
        for mut rule in self.permission_rules(ad_type) {
            if !rule.should_allow() {
                debug!(ad_type = %ad_type, reason = rule.last_message(), "Ad not allowed");
                return false;
            }
        }
        true
    }

    /// Whether `ad` must be dropped from the candidate pool.
    pub fn should_exclude_ad(&self, ad: &CreativeAd) -> bool {
        for mut rule in self.exclusion_rules() {
            if rule.should_exclude(ad) {
                debug!(
                    creative_instance_id = %ad.creative_instance_id,
                    reason = rule.last_message(),
                    "Ad excluded"
                );
                return true;
            }
        }
        false
    }

    fn permission_rules(&self, ad_type: AdType) -> Vec<Box<dyn PermissionRule + 'a>> {
        match ad_type {
            AdType::AdNotification => vec![
                Box::new(AdsPerDayFrequencyCap::new(
                    self.ad_events,
                    AdType::AdNotification,
                    ConfirmationType::Served,
                    self.config.ads_per_day,
                    self.now,
                )),
                Box::new(AdsPerHourFrequencyCap::new(
                    self.ad_events,
                    self.config.ads_per_hour,
                    self.now,
                )),
                Box::new(MinimumWaitTimeFrequencyCap::new(
                    self.ad_events,
                    self.config.ads_per_hour,
                    self.now,
                )),
            ],
            other => vec![Box::new(AdsPerDayFrequencyCap::new(
                self.ad_events,
                other,
                ConfirmationType::Viewed,
                self.config.viewed_ads_per_day,
                self.now,
            ))],
        }
    }

    fn exclusion_rules(&self) -> Vec<Box<dyn ExclusionRule<CreativeAd> + 'a>> {
        vec![
            Box::new(DaypartExclusionRule::new(self.now)),
            Box::new(GeoTargetExclusionRule::new(self.config.user_region.as_deref())),
            Box::new(AntiTargetingExclusionRule::new(
                &self.config.anti_targeting,
                self.history,
            )),
            Box::new(PerDayExclusionRule::new(self.ad_events, self.now)),
            Box::new(DailyCapExclusionRule::new(self.ad_events, self.now)),
            Box::new(TotalMaxExclusionRule::new(self.ad_events)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsched_testing::{creative_ad, monday_morning, served, served_n, CreativeAdBuilder};
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(0, 1, true)]
    #[case::below_cap(1, 2, true)]
    #[case::at_cap(2, 2, false)]
    #[case::above_cap(3, 2, false)]
    #[case::zero_cap(0, 0, false)]
    fn test_rolling_cap_boundary(#[case] events: usize, #[case] cap: u32, #[case] expected: bool) {
        let now = monday_morning();
        let history: Vec<_> = (0..events)
            .map(|i| now - Duration::minutes(i as i64))
            .collect();

        assert_eq!(
            does_history_respect_cap_for_rolling_time_constraint(&history, Duration::days(1), cap, now),
            expected
        );
    }

    #[test]
    fn test_rolling_window_ignores_old_events() {
        let now = monday_morning();
        let history = vec![now - Duration::days(2), now - Duration::hours(25)];

        assert!(does_history_respect_cap_for_rolling_time_constraint(
            &history,
            Duration::days(1),
            1,
            now
        ));
    }

    #[test]
    fn test_window_start_is_inclusive() {
        let now = monday_morning();
        let history = vec![now - Duration::days(1)];

        assert!(!does_history_respect_cap_for_rolling_time_constraint(
            &history,
            Duration::days(1),
            1,
            now
        ));
    }

    #[test]
    fn test_aggregate_allows_fresh_history() {
        let config = FrequencyCapConfig::default();
        let capping = FrequencyCapping::new(&config, &[], &[], monday_morning());

        assert!(capping.is_ad_allowed());
        assert!(!capping.should_exclude_ad(&creative_ad("travel")));
    }

    #[test]
    fn test_aggregate_excludes_capped_creative_set() {
        let config = FrequencyCapConfig::default();
        let now = monday_morning();
        let ad = CreativeAdBuilder::new("travel").per_day(2).build();
        let events = served_n(&ad, 2, now - Duration::hours(3));

        let capping = FrequencyCapping::new(&config, &events, &[], now);
        assert!(capping.should_exclude_ad(&ad));
        assert!(!capping.should_exclude_ad(&creative_ad("travel")));
    }

    #[test]
    fn test_aggregate_denies_within_minimum_wait() {
        let config = FrequencyCapConfig::default();
        let now = monday_morning();
        let events = vec![served(&creative_ad("travel"), now - Duration::minutes(5))];

        let capping = FrequencyCapping::new(&config, &events, &[], now);
        assert!(!capping.is_ad_allowed());
        assert!(capping.is_ad_type_allowed(AdType::InlineContentAd));
    }

    proptest! {
        #[test]
        fn prop_cap_boundary_is_strict(cap in 1u32..20) {
            let now = monday_morning();
            let at_cap: Vec<_> = (0..cap).map(|i| now - Duration::seconds(i64::from(i))).collect();
            let below_cap = &at_cap[1..];

            prop_assert!(!does_history_respect_cap_for_rolling_time_constraint(
                &at_cap, Duration::hours(1), cap, now
            ));
            prop_assert!(does_history_respect_cap_for_rolling_time_constraint(
                below_cap, Duration::hours(1), cap, now
            ));
        }
    }
}
