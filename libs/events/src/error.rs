//! Error types for event records.

use thiserror::Error;

/// Errors raised while building an event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Reasons must be non-empty CamelCase identifiers.
    #[error("invalid event reason: {0:?}")]
    InvalidReason(String),

    /// The involved object has no name.
    #[error("event for {kind} has no object name")]
    MissingObject { kind: String },
}
