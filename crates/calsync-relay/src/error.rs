//! Error types for the remote agent channel.

use calsync_core::domain::{AgentId, DomainError, SourceId};
use thiserror::Error;

/// Errors returned to agents and to callers managing them
#[derive(Error, Debug)]
pub enum RelayError {
    /// The bearer credential matches no enabled agent
    #[error("unauthorized: unknown or revoked agent credential")]
    Unauthorized,

    /// The agent pushed for a source it is not bound to
    #[error("agent {agent} is not allowed to push for source {source_id}")]
    Forbidden { agent: AgentId, source_id: SourceId },

    #[error("unknown source: {0}")]
    UnknownSource(SourceId),

    /// Only sources with the `agent` sync method accept pushed events
    #[error("source {0} is not agent-relayed")]
    NotRelayed(SourceId),

    #[error("inbox for source {source_id} is full ({capacity} pending batches)")]
    InboxFull { source_id: SourceId, capacity: usize },

    #[error("batch of {len} events exceeds the limit of {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("invalid input: {0}")]
    Invalid(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
