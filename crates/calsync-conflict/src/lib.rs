//! calsync Conflict - change detection and conflict resolution
//!
//! Provides:
//! - Fingerprint-based change detection against the dedup index
//! - The four destination conflict policies (`source_wins`,
//!   `destination_wins`, `latest_wins`, `manual`)

pub mod detector;
pub mod error;
pub mod policy;

pub use detector::{ChangeDetector, Classification};
pub use error::ConflictError;
pub use policy::{Decision, PolicyEngine};
