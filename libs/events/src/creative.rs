//! Creative ad catalog types.

use adsched_id::{AdUuid, AdvertiserId, CampaignId, CreativeInstanceId, CreativeSetId};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::types::AdType;

/// Minutes in a day; daypart bounds are minutes of day in `0..MINUTES_PER_DAY`.
pub const MINUTES_PER_DAY: u32 = 24 * 60;

// =============================================================================
// Daypart
// =============================================================================

/// A weekly time window during which a campaign may serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Daypart {
    /// Days of week as digits, `0` = Sunday through `6` = Saturday.
    pub days_of_week: String,

    /// First minute of day (inclusive).
    pub start_minute: u32,

    /// Last minute of day (inclusive).
    pub end_minute: u32,
}

impl Default for Daypart {
    fn default() -> Self {
        Self {
            days_of_week: "0123456".to_string(),
            start_minute: 0,
            end_minute: MINUTES_PER_DAY - 1,
        }
    }
}

impl Daypart {
    /// Returns true if `at` falls inside this window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let day = at.weekday().num_days_from_sunday();
        let Some(day_char) = char::from_digit(day, 10) else {
            return false;
        };

        if !self.days_of_week.contains(day_char) {
            return false;
        }

        let minute = at.hour() * 60 + at.minute();
        minute >= self.start_minute && minute <= self.end_minute
    }

    /// Check the window is well formed.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.days_of_week.is_empty() {
            return Err(EventError::InvalidDaypart("no days of week".to_string()));
        }

        if let Some(c) = self.days_of_week.chars().find(|c| !('0'..='6').contains(c)) {
            return Err(EventError::InvalidDaypart(format!("invalid day of week '{}'", c)));
        }

        if self.start_minute > self.end_minute || self.end_minute >= MINUTES_PER_DAY {
            return Err(EventError::InvalidDaypart(format!(
                "invalid minutes {}..={}",
                self.start_minute, self.end_minute
            )));
        }

        Ok(())
    }
}

// =============================================================================
// Creative Ad
// =============================================================================

/// A creative ad candidate as loaded from the catalog store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreativeAd {
    pub creative_instance_id: CreativeInstanceId,
    pub creative_set_id: CreativeSetId,
    pub campaign_id: CampaignId,
    pub advertiser_id: AdvertiserId,

    /// Targeting segment, e.g. `technology & computing-software`.
    pub segment: String,

    /// Maximum serves per creative set in a rolling day.
    pub per_day: u32,

    /// Maximum serves per creative set ever.
    pub total_max: u32,

    /// Maximum serves per campaign in a rolling day. Zero means uncapped.
    pub daily_cap: u32,

    /// Lower values win among surviving candidates. Zero is never served.
    pub priority: u32,

    /// Pacing ratio in `[0, 1]`; the chance the ad survives pacing.
    pub ptr: f64,

    /// Serving windows. Empty means always.
    #[serde(default)]
    pub dayparts: Vec<Daypart>,

    /// Country or region codes (`US`, `US-CA`). Empty means everywhere.
    #[serde(default)]
    pub geo_targets: Vec<String>,

    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,

    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub target_url: String,
}

impl CreativeAd {
    /// Returns true if the campaign flight contains `now` (inclusive).
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now <= self.end_at
    }

    /// Case-insensitive segment comparison.
    pub fn matches_segment(&self, segment: &str) -> bool {
        self.segment.eq_ignore_ascii_case(segment)
    }

    /// Check the row is well formed.
    pub fn validate(&self) -> Result<(), EventError> {
        let invalid = |message: String| EventError::InvalidCreativeAd {
            creative_instance_id: self.creative_instance_id.to_string(),
            message,
        };

        if self.segment.trim().is_empty() {
            return Err(invalid("empty segment".to_string()));
        }

        if !(0.0..=1.0).contains(&self.ptr) {
            return Err(invalid(format!("ptr {} outside [0, 1]", self.ptr)));
        }

        if self.start_at > self.end_at {
            return Err(invalid("start_at after end_at".to_string()));
        }

        for daypart in &self.dayparts {
            daypart.validate().map_err(|e| invalid(e.to_string()))?;
        }

        Ok(())
    }
}

// =============================================================================
// Ad Notification
// =============================================================================

/// An ad ready for the delivery sink: a creative plus a fresh placement ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdNotification {
    pub uuid: AdUuid,
    pub ad_type: AdType,
    pub creative_instance_id: CreativeInstanceId,
    pub creative_set_id: CreativeSetId,
    pub campaign_id: CampaignId,
    pub advertiser_id: AdvertiserId,
    pub segment: String,
    pub title: String,
    pub body: String,
    pub target_url: String,
}

impl AdNotification {
    /// Build a placement for the given creative.
    pub fn from_creative(ad: &CreativeAd, ad_type: AdType, uuid: AdUuid) -> Self {
        Self {
            uuid,
            ad_type,
            creative_instance_id: ad.creative_instance_id,
            creative_set_id: ad.creative_set_id,
            campaign_id: ad.campaign_id,
            advertiser_id: ad.advertiser_id,
            segment: ad.segment.clone(),
            title: ad.title.clone(),
            body: ad.body.clone(),
            target_url: ad.target_url.clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn creative() -> CreativeAd {
        CreativeAd {
            creative_instance_id: CreativeInstanceId::from_u128(1),
            creative_set_id: CreativeSetId::from_u128(2),
            campaign_id: CampaignId::from_u128(3),
            advertiser_id: AdvertiserId::from_u128(4),
            segment: "Technology & Computing-Software".to_string(),
            per_day: 3,
            total_max: 10,
            daily_cap: 5,
            priority: 1,
            ptr: 1.0,
            dayparts: vec![],
            geo_targets: vec!["US".to_string()],
            start_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            end_at: Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap(),
            title: "Title".to_string(),
            body: "Body".to_string(),
            target_url: "https://example.com".to_string(),
        }
    }

    #[test]
    fn test_daypart_contains() {
        // 2026-10-19 is a Monday.
        let monday_noon = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let weekdays = Daypart {
            days_of_week: "12345".to_string(),
            start_minute: 9 * 60,
            end_minute: 17 * 60,
        };
        assert!(weekdays.contains(monday_noon));

        let evenings = Daypart {
            days_of_week: "12345".to_string(),
            start_minute: 18 * 60,
            end_minute: 23 * 60,
        };
        assert!(!evenings.contains(monday_noon));

        let weekend = Daypart {
            days_of_week: "06".to_string(),
            ..Daypart::default()
        };
        assert!(!weekend.contains(monday_noon));
    }

    #[test]
    fn test_daypart_bounds_inclusive() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 17, 0, 0).unwrap();
        let daypart = Daypart {
            days_of_week: "1".to_string(),
            start_minute: 17 * 60,
            end_minute: 17 * 60,
        };
        assert!(daypart.contains(at));
    }

    #[test]
    fn test_daypart_validate() {
        assert!(Daypart::default().validate().is_ok());
        let bad = Daypart {
            days_of_week: "7".to_string(),
            ..Daypart::default()
        };
        assert!(bad.validate().is_err());
        let reversed = Daypart {
            start_minute: 100,
            end_minute: 10,
            ..Daypart::default()
        };
        assert!(reversed.validate().is_err());
    }

    #[test]
    fn test_creative_active_window() {
        let ad = creative();
        assert!(ad.is_active_at(ad.start_at));
        assert!(ad.is_active_at(ad.end_at));
        assert!(!ad.is_active_at(ad.end_at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_creative_segment_case_insensitive() {
        let ad = creative();
        assert!(ad.matches_segment("technology & computing-software"));
        assert!(!ad.matches_segment("technology & computing"));
    }

    #[test]
    fn test_creative_validate_ptr() {
        let mut ad = creative();
        assert!(ad.validate().is_ok());
        ad.ptr = 1.5;
        assert!(matches!(
            ad.validate(),
            Err(EventError::InvalidCreativeAd { .. })
        ));
    }

    #[test]
    fn test_notification_from_creative() {
        let ad = creative();
        let uuid = AdUuid::from_u128(99);
        let notification = AdNotification::from_creative(&ad, AdType::AdNotification, uuid);
        assert_eq!(notification.uuid, uuid);
        assert_eq!(notification.creative_instance_id, ad.creative_instance_id);
        assert_eq!(notification.segment, ad.segment);
    }
}
