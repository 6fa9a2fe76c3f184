//! Exclusion rules: per-candidate caps and targeting.

use std::collections::HashMap;

use adsched_events::{AdEvent, AdNotification, ConfirmationType, CreativeAd};
use adsched_id::CreativeSetId;
use chrono::{DateTime, Duration, Utc};

use super::{does_history_respect_cap_for_rolling_time_constraint, timestamps_where, ExclusionRule};

fn served_timestamps<F>(ad_events: &[AdEvent], matches: F) -> Vec<DateTime<Utc>>
where
    F: Fn(&AdEvent) -> bool,
{
    timestamps_where(ad_events, |event| {
        event.confirmation_type == ConfirmationType::Served && matches(event)
    })
}

// =============================================================================
// Event caps
// =============================================================================

/// Creative set served at most `per_day` times per rolling day.
pub struct PerDayExclusionRule<'a> {
    ad_events: &'a [AdEvent],
    now: DateTime<Utc>,
    last_message: String,
}

impl<'a> PerDayExclusionRule<'a> {
    pub fn new(ad_events: &'a [AdEvent], now: DateTime<Utc>) -> Self {
        Self {
            ad_events,
            now,
            last_message: String::new(),
        }
    }
}

impl ExclusionRule<CreativeAd> for PerDayExclusionRule<'_> {
    fn should_exclude(&mut self, ad: &CreativeAd) -> bool {
        let history = served_timestamps(self.ad_events, |event| {
            event.creative_set_id == ad.creative_set_id
        });
        if !does_history_respect_cap_for_rolling_time_constraint(
            &history,
            Duration::days(1),
            ad.per_day,
            self.now,
        ) {
            self.last_message = format!(
                "creative set {} has reached its per day cap of {}",
                ad.creative_set_id, ad.per_day
            );
            return true;
        }
        false
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

/// Creative set served at most `total_max` times ever.
pub struct TotalMaxExclusionRule<'a> {
    ad_events: &'a [AdEvent],
    last_message: String,
}

impl<'a> TotalMaxExclusionRule<'a> {
    pub fn new(ad_events: &'a [AdEvent]) -> Self {
        Self {
            ad_events,
            last_message: String::new(),
        }
    }
}

impl ExclusionRule<CreativeAd> for TotalMaxExclusionRule<'_> {
    fn should_exclude(&mut self, ad: &CreativeAd) -> bool {
        let count = self
            .ad_events
            .iter()
            .filter(|event| {
                event.confirmation_type == ConfirmationType::Served
                    && event.creative_set_id == ad.creative_set_id
            })
            .count();
        if count as u64 >= u64::from(ad.total_max) {
            self.last_message = format!(
                "creative set {} has reached its total cap of {}",
                ad.creative_set_id, ad.total_max
            );
            return true;
        }
        false
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

/// Campaign served at most `daily_cap` times per rolling day. Zero means
/// uncapped.
pub struct DailyCapExclusionRule<'a> {
    ad_events: &'a [AdEvent],
    now: DateTime<Utc>,
    last_message: String,
}

impl<'a> DailyCapExclusionRule<'a> {
    pub fn new(ad_events: &'a [AdEvent], now: DateTime<Utc>) -> Self {
        Self {
            ad_events,
            now,
            last_message: String::new(),
        }
    }
}

impl ExclusionRule<CreativeAd> for DailyCapExclusionRule<'_> {
    fn should_exclude(&mut self, ad: &CreativeAd) -> bool {
        if ad.daily_cap == 0 {
            return false;
        }
        let history = served_timestamps(self.ad_events, |event| event.campaign_id == ad.campaign_id);
        if !does_history_respect_cap_for_rolling_time_constraint(
            &history,
            Duration::days(1),
            ad.daily_cap,
            self.now,
        ) {
            self.last_message = format!(
                "campaign {} has reached its daily cap of {}",
                ad.campaign_id, ad.daily_cap
            );
            return true;
        }
        false
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

/// A placement may be viewed at most `cap` times.
pub struct AdUuidFrequencyCap<'a> {
    ad_events: &'a [AdEvent],
    cap: u32,
    last_message: String,
}

impl<'a> AdUuidFrequencyCap<'a> {
    pub fn new(ad_events: &'a [AdEvent], cap: u32) -> Self {
        Self {
            ad_events,
            cap,
            last_message: String::new(),
        }
    }
}

impl ExclusionRule<AdNotification> for AdUuidFrequencyCap<'_> {
    fn should_exclude(&mut self, ad: &AdNotification) -> bool {
        let count = self
            .ad_events
            .iter()
            .filter(|event| {
                event.ad_uuid == ad.uuid
                    && event.ad_type == ad.ad_type
                    && event.confirmation_type == ConfirmationType::Viewed
            })
            .count();
        if count as u64 >= u64::from(self.cap) {
            self.last_message = format!(
                "uuid {} has been viewed {} times, cap is {}",
                ad.uuid, count, self.cap
            );
            return true;
        }
        false
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

// =============================================================================
// Targeting
// =============================================================================

/// Ad must run at the current day of week and minute of day, if it
/// declares dayparts.
pub struct DaypartExclusionRule {
    now: DateTime<Utc>,
    last_message: String,
}

impl DaypartExclusionRule {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            last_message: String::new(),
        }
    }
}

impl ExclusionRule<CreativeAd> for DaypartExclusionRule {
    fn should_exclude(&mut self, ad: &CreativeAd) -> bool {
        if ad.dayparts.is_empty() || ad.dayparts.iter().any(|d| d.contains(self.now)) {
            return false;
        }
        self.last_message = format!(
            "creative instance {} is not scheduled for {}",
            ad.creative_instance_id,
            self.now.format("%a %H:%M")
        );
        true
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

/// Ad must target the user's region or its country, if both are known.
pub struct GeoTargetExclusionRule<'a> {
    region: Option<&'a str>,
    last_message: String,
}

impl<'a> GeoTargetExclusionRule<'a> {
    pub fn new(region: Option<&'a str>) -> Self {
        Self {
            region,
            last_message: String::new(),
        }
    }
}

impl ExclusionRule<CreativeAd> for GeoTargetExclusionRule<'_> {
    fn should_exclude(&mut self, ad: &CreativeAd) -> bool {
        let Some(region) = self.region else {
            return false;
        };
        if ad.geo_targets.is_empty() {
            return false;
        }

        let country = region.split('-').next().unwrap_or(region);
        let targeted = ad
            .geo_targets
            .iter()
            .any(|target| target.eq_ignore_ascii_case(region) || target.eq_ignore_ascii_case(country));
        if !targeted {
            self.last_message = format!(
                "creative instance {} does not target {}",
                ad.creative_instance_id, region
            );
            return true;
        }
        false
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

/// Creative set must not be shown to visitors of its anti-target sites.
pub struct AntiTargetingExclusionRule<'a> {
    anti_targeting: &'a HashMap<CreativeSetId, Vec<String>>,
    history: &'a [String],
    last_message: String,
}

impl<'a> AntiTargetingExclusionRule<'a> {
    pub fn new(anti_targeting: &'a HashMap<CreativeSetId, Vec<String>>, history: &'a [String]) -> Self {
        Self {
            anti_targeting,
            history,
            last_message: String::new(),
        }
    }
}

impl ExclusionRule<CreativeAd> for AntiTargetingExclusionRule<'_> {
    fn should_exclude(&mut self, ad: &CreativeAd) -> bool {
        let Some(sites) = self.anti_targeting.get(&ad.creative_set_id) else {
            return false;
        };

        let visited = self.history.iter().filter_map(|url| host(url)).find(|visited| {
            sites
                .iter()
                .filter_map(|site| host(site))
                .any(|site| same_domain_or_host(visited, &site))
        });
        if let Some(visited) = visited {
            self.last_message = format!(
                "creative set {} is anti-targeted for visitors of {}",
                ad.creative_set_id, visited
            );
            return true;
        }
        false
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

/// Host part of a URL or bare host, lowercased.
fn host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = host_port.split(':').next()?.trim_end_matches('.');
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// `visited` is `site` or one of its subdomains.
fn same_domain_or_host(visited: &str, site: &str) -> bool {
    visited == site
        || visited
            .strip_suffix(site)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
