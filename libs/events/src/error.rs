//! Error types for event and catalog handling.

use thiserror::Error;

/// Errors that can occur when handling ad events and catalog rows.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The ad type is unknown.
    #[error("unknown ad type: {0}")]
    UnknownAdType(String),

    /// The confirmation type is unknown.
    #[error("unknown confirmation type: {0}")]
    UnknownConfirmationType(String),

    /// A daypart window is malformed.
    #[error("invalid daypart: {0}")]
    InvalidDaypart(String),

    /// A creative ad row is malformed.
    #[error("invalid creative ad {creative_instance_id}: {message}")]
    InvalidCreativeAd {
        creative_instance_id: String,
        message: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
