//! Domain entities and business logic
//!
//! This module contains the core domain types for calsync:
//! - Newtypes for identifiers and opaque provider values
//! - The normalized event model and its content fingerprint
//! - Sources, the destination, agents and the configuration that holds them
//! - Dedup index records and pass results
//! - Relay inbox records for agent-pushed events
//! - Domain-specific error types

pub mod agent;
pub mod configuration;
pub mod dedup;
pub mod destination;
pub mod errors;
pub mod event;
pub mod newtypes;
pub mod relay;
pub mod result;
pub mod source;

// Re-export commonly used types
pub use agent::{AgentRegistration, AgentStatus, DEFAULT_AGENT_INTERVAL_MINUTES};
pub use configuration::{GlobalSettings, SyncConfiguration};
pub use dedup::{BatchCommit, DedupChange, DedupEntry};
pub use destination::{ColorManagement, ConflictPolicy, SyncDestination};
pub use errors::DomainError;
pub use event::{dedup_key, EventParticipant, EventStatus, NormalizedEvent, ProviderType, Visibility};
pub use newtypes::*;
pub use relay::{
    parse_relay_cursor, relay_cursor, RejectedEvent, RelayBatch, RelayReceipt, RelayState,
};
pub use result::{
    ConflictRecord, ErrorKind, EventCounters, SkipReason, SkippedSource, SourceError, SyncResult,
    SyncStatus,
};
pub use source::{
    AuthState, FrequencyIntervals, SyncDirection, SyncFrequency, SyncMethod, SyncSource,
};
