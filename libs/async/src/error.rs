//! Error types for async results and contexts.

use thiserror::Error;

/// Errors from resolving or awaiting an [`AsyncResult`](crate::AsyncResult).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AsyncError {
    /// `complete` was called on a result that already has a value.
    #[error("result already completed")]
    AlreadyCompleted,

    /// Every resolver was dropped before completing.
    #[error("result abandoned before completion")]
    Abandoned,
}

/// Errors from context service lookup and registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// No service of this type was provided.
    #[error("service not provided: {0}")]
    MissingService(&'static str),

    /// A service of this type was already provided.
    #[error("service already provided: {0}")]
    DuplicateService(&'static str),
}
