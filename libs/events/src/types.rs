//! Ad event type definitions.
//!
//! The event log is append-only. Frequency capping reads it as a snapshot and
//! never mutates it.

use std::str::FromStr;

use adsched_id::{AdUuid, AdvertiserId, CampaignId, CreativeInstanceId, CreativeSetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::creative::AdNotification;
use crate::error::EventError;

// =============================================================================
// Ad Types
// =============================================================================

/// The surface an ad was shown on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdType {
    AdNotification,
    NewTabPageAd,
    PromotedContentAd,
    InlineContentAd,
}

impl AdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdType::AdNotification => "ad_notification",
            AdType::NewTabPageAd => "new_tab_page_ad",
            AdType::PromotedContentAd => "promoted_content_ad",
            AdType::InlineContentAd => "inline_content_ad",
        }
    }
}

impl std::fmt::Display for AdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ad_notification" => Ok(AdType::AdNotification),
            "new_tab_page_ad" => Ok(AdType::NewTabPageAd),
            "promoted_content_ad" => Ok(AdType::PromotedContentAd),
            "inline_content_ad" => Ok(AdType::InlineContentAd),
            other => Err(EventError::UnknownAdType(other.to_string())),
        }
    }
}

// =============================================================================
// Confirmation Types
// =============================================================================

/// What happened to a delivered ad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationType {
    Served,
    Viewed,
    Clicked,
    Dismissed,
    Transferred,
    Flagged,
    Upvoted,
    Downvoted,
    Conversion,
}

impl ConfirmationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationType::Served => "served",
            ConfirmationType::Viewed => "viewed",
            ConfirmationType::Clicked => "clicked",
            ConfirmationType::Dismissed => "dismissed",
            ConfirmationType::Transferred => "transferred",
            ConfirmationType::Flagged => "flagged",
            ConfirmationType::Upvoted => "upvoted",
            ConfirmationType::Downvoted => "downvoted",
            ConfirmationType::Conversion => "conversion",
        }
    }
}

impl std::fmt::Display for ConfirmationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfirmationType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "served" => Ok(ConfirmationType::Served),
            "viewed" => Ok(ConfirmationType::Viewed),
            "clicked" => Ok(ConfirmationType::Clicked),
            "dismissed" => Ok(ConfirmationType::Dismissed),
            "transferred" => Ok(ConfirmationType::Transferred),
            "flagged" => Ok(ConfirmationType::Flagged),
            "upvoted" => Ok(ConfirmationType::Upvoted),
            "downvoted" => Ok(ConfirmationType::Downvoted),
            "conversion" => Ok(ConfirmationType::Conversion),
            other => Err(EventError::UnknownConfirmationType(other.to_string())),
        }
    }
}

// =============================================================================
// Ad Event
// =============================================================================

/// A single entry in the ad event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdEvent {
    /// Placement the event belongs to.
    pub ad_uuid: AdUuid,

    pub creative_instance_id: CreativeInstanceId,
    pub creative_set_id: CreativeSetId,
    pub campaign_id: CampaignId,
    pub advertiser_id: AdvertiserId,

    pub ad_type: AdType,
    pub confirmation_type: ConfirmationType,

    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl AdEvent {
    /// Build an event for a delivered ad.
    pub fn for_ad(
        ad: &AdNotification,
        confirmation_type: ConfirmationType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ad_uuid: ad.uuid,
            creative_instance_id: ad.creative_instance_id,
            creative_set_id: ad.creative_set_id,
            campaign_id: ad.campaign_id,
            advertiser_id: ad.advertiser_id,
            ad_type: ad.ad_type,
            confirmation_type,
            created_at,
        }
    }

    /// Returns true if this event has the given ad type and confirmation type.
    pub fn is(&self, ad_type: AdType, confirmation_type: ConfirmationType) -> bool {
        self.ad_type == ad_type && self.confirmation_type == confirmation_type
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ad_type_roundtrip() {
        for ad_type in [
            AdType::AdNotification,
            AdType::NewTabPageAd,
            AdType::PromotedContentAd,
            AdType::InlineContentAd,
        ] {
            assert_eq!(ad_type.as_str().parse::<AdType>().unwrap(), ad_type);
        }
    }

    #[test]
    fn test_unknown_confirmation_type() {
        let err = "teleported".parse::<ConfirmationType>().unwrap_err();
        assert_eq!(err, EventError::UnknownConfirmationType("teleported".to_string()));
    }

    #[test]
    fn test_confirmation_type_display_matches_serde() {
        let json = serde_json::to_string(&ConfirmationType::Transferred).unwrap();
        assert_eq!(json, format!("\"{}\"", ConfirmationType::Transferred));
        assert_eq!("clicked".parse::<ConfirmationType>().unwrap(), ConfirmationType::Clicked);
    }

    #[test]
    fn test_ad_type_serde_snake_case() {
        let json = serde_json::to_string(&AdType::InlineContentAd).unwrap();
        assert_eq!(json, "\"inline_content_ad\"");
    }
}
