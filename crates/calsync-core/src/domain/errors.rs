//! Domain error types
//!
//! Validation failures raised while constructing identifiers, events and
//! configuration records.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// ID parsing or validation error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Calendar identifier rejected
    #[error("Invalid calendar ID: {0}")]
    InvalidCalendarId(String),

    /// Sync token rejected
    #[error("Invalid sync token: {0}")]
    InvalidSyncToken(String),

    /// Destination event identifier rejected
    #[error("Invalid destination event ID: {0}")]
    InvalidEventId(String),

    /// An event failed its structural checks
    #[error("Invalid event {id}: {reason}")]
    InvalidEvent {
        /// Provider event id of the rejected event
        id: String,
        /// What was wrong with it
        reason: String,
    },

    /// A configuration record failed validation
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// An id that must be unique is already taken
    #[error("Duplicate {kind} id: {id}")]
    Duplicate {
        /// Kind of record ("source", "agent")
        kind: &'static str,
        /// Offending id
        id: String,
    },
}
