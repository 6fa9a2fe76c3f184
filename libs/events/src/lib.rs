//! # adsched-events
//!
//! Ad event log and creative ad catalog types for the adsched engine.
//!
//! ## Design Principles
//!
//! - Ad events are immutable records appended to a log; they are never edited
//! - Every event names the placement (`AdUuid`) and the creative it showed
//! - Creative ads are read-mostly catalog rows, loaded per serving cycle
//! - Segment strings are compared case-insensitively
//!
//! ## Event Types
//!
//! An [`AdEvent`] pairs an [`AdType`] (which surface showed the ad) with a
//! [`ConfirmationType`] (what happened: served, viewed, clicked, ...).

mod creative;
mod error;
pub mod segment;
mod types;

pub use creative::*;
pub use error::EventError;
pub use types::*;
