//! Relay inbox records
//!
//! Events pushed by remote agents are parked as sequenced batches until the
//! controller has committed them for every calendar they touch. The records
//! here are what the state store persists for that inbox.
//!
//! ## Design Notes
//!
//! - Sequence numbers are per source, start at 1 and never repeat, so a
//!   relay cursor stays meaningful across restarts.
//! - A relay cursor is the sync token `relay:{seq}`; committing it for a
//!   calendar marks every batch up to `seq` as consumed by that calendar.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::event::NormalizedEvent;
use super::newtypes::{CalendarId, SourceId, SyncToken};

const CURSOR_PREFIX: &str = "relay:";

/// Sync token that points just past batch `seq`
pub fn relay_cursor(seq: u64) -> Result<SyncToken, DomainError> {
    SyncToken::new(format!("{CURSOR_PREFIX}{seq}"))
}

/// Sequence number of a relay cursor, `None` for any other token
pub fn parse_relay_cursor(token: &SyncToken) -> Option<u64> {
    token
        .as_str()
        .strip_prefix(CURSOR_PREFIX)
        .and_then(|seq| seq.parse().ok())
}

/// One accepted push, waiting to be consumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayBatch {
    pub source_id: SourceId,
    pub seq: u64,
    pub events: Vec<NormalizedEvent>,
    pub received_at: DateTime<Utc>,
}

impl RelayBatch {
    /// Calendars that still have to consume this batch
    pub fn calendars(&self) -> BTreeSet<CalendarId> {
        self.events.iter().map(|e| e.calendar_id.clone()).collect()
    }
}

/// An event refused at push time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEvent {
    pub provider_event_id: String,
    pub reason: String,
}

/// Outcome of the last accepted push of a source
///
/// Kept so a retransmission of the same agent cursor gets the same answer,
/// also after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReceipt {
    pub agent_cursor: String,
    /// Sequence of the stored batch; `None` when every event was rejected
    pub seq: Option<u64>,
    pub accepted: usize,
    pub rejected: Vec<RejectedEvent>,
}

/// Durable inbox position of one source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayState {
    /// Highest sequence ever assigned (0 before the first batch)
    pub last_seq: u64,
    pub last_receipt: Option<RelayReceipt>,
}

impl RelayState {
    /// Receipt for `agent_cursor`, if it was the last accepted push
    pub fn receipt_for(&self, agent_cursor: &str) -> Option<&RelayReceipt> {
        self.last_receipt
            .as_ref()
            .filter(|receipt| receipt.agent_cursor == agent_cursor)
    }
}
