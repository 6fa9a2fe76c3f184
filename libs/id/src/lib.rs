//! # adsched-id
//!
//! Typed identifiers for catalog entities and ad placements.
//!
//! ## Design Principles
//!
//! - Catalog IDs are issued upstream as UUIDs; the engine never invents them
//! - Placement IDs (`AdUuid`) are generated per delivery
//! - IDs are typed so a campaign ID cannot be passed where a creative set ID
//!   is expected
//! - Parsing is case-insensitive; formatting is canonical lowercase hyphenated
//!
//! Examples:
//! - `c2ba3e7d-f688-4bc4-a053-cbe7ac1e6123` (creative instance)
//! - `84197fc8-830a-4a8e-8339-7a70c2bfa104` (campaign)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
