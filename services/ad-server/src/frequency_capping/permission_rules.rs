//! Permission rules: caps on how many ads may be shown overall.

use adsched_events::{AdEvent, AdType, ConfirmationType};
use chrono::{DateTime, Duration, Utc};

use super::{does_history_respect_cap_for_rolling_time_constraint, timestamps_where, PermissionRule};

/// At most `cap` events of one ad type and confirmation type per rolling day.
pub struct AdsPerDayFrequencyCap<'a> {
    ad_events: &'a [AdEvent],
    ad_type: AdType,
    confirmation_type: ConfirmationType,
    cap: u32,
    now: DateTime<Utc>,
    last_message: String,
}

impl<'a> AdsPerDayFrequencyCap<'a> {
    pub fn new(
        ad_events: &'a [AdEvent],
        ad_type: AdType,
        confirmation_type: ConfirmationType,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ad_events,
            ad_type,
            confirmation_type,
            cap,
            now,
            last_message: String::new(),
        }
    }
}

impl PermissionRule for AdsPerDayFrequencyCap<'_> {
    fn should_allow(&mut self) -> bool {
        let history = timestamps_where(self.ad_events, |event| {
            event.is(self.ad_type, self.confirmation_type)
        });
        if !does_history_respect_cap_for_rolling_time_constraint(
            &history,
            Duration::days(1),
            self.cap,
            self.now,
        ) {
            self.last_message = format!(
                "{} {} events have reached the limit of {} per day",
                self.ad_type, self.confirmation_type, self.cap
            );
            return false;
        }
        true
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

/// At most `ads_per_hour` served ad notifications per rolling hour.
pub struct AdsPerHourFrequencyCap<'a> {
    ad_events: &'a [AdEvent],
    ads_per_hour: u32,
    now: DateTime<Utc>,
    last_message: String,
}

impl<'a> AdsPerHourFrequencyCap<'a> {
    pub fn new(ad_events: &'a [AdEvent], ads_per_hour: u32, now: DateTime<Utc>) -> Self {
        Self {
            ad_events,
            ads_per_hour,
            now,
            last_message: String::new(),
        }
    }
}

impl PermissionRule for AdsPerHourFrequencyCap<'_> {
    fn should_allow(&mut self) -> bool {
        let history = timestamps_where(self.ad_events, |event| {
            event.is(AdType::AdNotification, ConfirmationType::Served)
        });
        if !does_history_respect_cap_for_rolling_time_constraint(
            &history,
            Duration::hours(1),
            self.ads_per_hour,
            self.now,
        ) {
            self.last_message = format!(
                "ad notifications have reached the limit of {} per hour",
                self.ads_per_hour
            );
            return false;
        }
        true
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}

/// At most one served ad notification per `3600s / ads_per_hour`.
pub struct MinimumWaitTimeFrequencyCap<'a> {
    ad_events: &'a [AdEvent],
    ads_per_hour: u32,
    now: DateTime<Utc>,
    last_message: String,
}

impl<'a> MinimumWaitTimeFrequencyCap<'a> {
    pub fn new(ad_events: &'a [AdEvent], ads_per_hour: u32, now: DateTime<Utc>) -> Self {
        Self {
            ad_events,
            ads_per_hour,
            now,
            last_message: String::new(),
        }
    }
}

impl PermissionRule for MinimumWaitTimeFrequencyCap<'_> {
    fn should_allow(&mut self) -> bool {
        if self.ads_per_hour == 0 {
            self.last_message = "ad notifications are disabled".to_string();
            return false;
        }

        let wait = Duration::seconds(3600 / i64::from(self.ads_per_hour));
        let history = timestamps_where(self.ad_events, |event| {
            event.is(AdType::AdNotification, ConfirmationType::Served)
        });
        if !does_history_respect_cap_for_rolling_time_constraint(&history, wait, 1, self.now) {
            self.last_message = format!(
                "ad notifications must be at least {} seconds apart",
                wait.num_seconds()
            );
            return false;
        }
        true
    }

    fn last_message(&self) -> &str {
        &self.last_message
    }
}
