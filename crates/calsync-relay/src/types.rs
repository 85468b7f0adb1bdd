//! Wire types exchanged with remote agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use calsync_core::domain::{
    relay_cursor, AgentId, AgentStatus, DomainError, NormalizedEvent, RelayReceipt, SourceId,
    SyncToken,
};

pub use calsync_core::domain::RejectedEvent;

/// Events pushed by an agent for its bound source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBatch {
    pub source_id: SourceId,
    /// Agent-side position of this batch; resending the same cursor is a
    /// retransmission
    pub agent_cursor: String,
    pub events: Vec<NormalizedEvent>,
}

/// Reply to a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAck {
    /// Relay cursor of the enqueued batch; `None` when every event was
    /// rejected
    pub next_cursor: Option<SyncToken>,
    pub accepted: usize,
    pub rejected: Vec<RejectedEvent>,
}

impl AgentAck {
    /// Ack for a stored push receipt
    pub fn from_receipt(receipt: &RelayReceipt) -> Result<Self, DomainError> {
        Ok(Self {
            next_cursor: receipt.seq.map(relay_cursor).transpose()?,
            accepted: receipt.accepted,
            rejected: receipt.rejected.clone(),
        })
    }
}

/// Monitoring view of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub name: String,
    pub source_id: SourceId,
    pub last_check_in: Option<DateTime<Utc>>,
    pub status: AgentStatus,
}

impl AgentHealth {
    pub fn is_stale(&self) -> bool {
        self.status == AgentStatus::Stale
    }
}
