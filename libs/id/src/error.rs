//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The UUID portion of the ID is invalid.
    #[error("invalid {kind}: {message}")]
    InvalidUuid { kind: &'static str, message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }

    /// Kind of identifier that failed to parse.
    pub fn kind(&self) -> &'static str {
        match self {
            IdError::Empty { kind } | IdError::InvalidUuid { kind, .. } => kind,
        }
    }
}
