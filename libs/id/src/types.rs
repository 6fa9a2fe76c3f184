//! Typed ID definitions for catalog entities and placements.

use crate::define_id;

// =============================================================================
// Catalog
// =============================================================================

define_id!(CampaignId, "campaign id");
define_id!(AdvertiserId, "advertiser id");
define_id!(CreativeSetId, "creative set id");
define_id!(CreativeInstanceId, "creative instance id");

// =============================================================================
// Placements
// =============================================================================

// One per delivered ad. Events for the same placement share it.
define_id!(AdUuid, "ad uuid");

// =============================================================================
// Tests
// =============================================================================
