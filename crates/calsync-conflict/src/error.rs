//! Error types for the conflict engine

use thiserror::Error;

/// Errors that can occur while applying a conflict policy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// `latest_wins` was asked to decide without the destination's version
    #[error("destination version required for latest_wins ({0})")]
    MissingDestinationVersion(String),
}
