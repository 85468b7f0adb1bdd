//! calsync Sync - Synchronization controller
//!
//! Provides:
//! - Per-source passes that fetch, reconcile and commit events page by page
//! - Per-source mutual exclusion (a second pass fails fast with `Busy`)
//! - In-pass retry with exponential backoff for provider calls
//! - Frequency-driven scheduling with an on-demand trigger path
//!
//! ## Modules
//!
//! - [`controller`] - `SyncController`: `run_all`, `run_source` and the
//!   configuration surfaces
//! - [`scheduler`] - `SyncScheduler`: next-due tracking and a run loop that
//!   runs passes as concurrent tasks
//! - [`locks`] - per-source lock registry

pub mod controller;
pub mod history;
pub mod locks;
mod pass;
pub mod retry;
pub mod scheduler;

pub use controller::SyncController;
pub use scheduler::{SchedulerHandle, SyncScheduler};

use calsync_core::domain::{DomainError, ErrorKind, SourceId};
use thiserror::Error;

/// Errors returned by controller entry points
///
/// Everything that happens inside a pass is captured in its
/// [`SyncResult`](calsync_core::domain::SyncResult); these are the cases
/// where no pass runs at all.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// No source with this id is configured
    #[error("Source not found: {0}")]
    NotFound(SourceId),

    /// The source exists but is disabled
    #[error("Source disabled: {0}")]
    Disabled(SourceId),

    /// A pass for the source is already in flight
    #[error("Source busy: {0}")]
    Busy(SourceId),

    /// A configuration edit was rejected
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] DomainError),

    /// The state store failed
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ControllerError {
    /// Taxonomy entry for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::NotFound(_) => ErrorKind::NotFound,
            ControllerError::Disabled(_) => ErrorKind::Disabled,
            ControllerError::Busy(_) => ErrorKind::Busy,
            ControllerError::Configuration(_) => ErrorKind::Configuration,
            ControllerError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Splits a configuration-edit failure into validation and storage
    pub(crate) fn from_edit(err: anyhow::Error) -> Self {
        match err.downcast::<DomainError>() {
            Ok(domain) => ControllerError::Configuration(domain),
            Err(other) => ControllerError::Storage(other),
        }
    }
}
