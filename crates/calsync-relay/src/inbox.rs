//! Per-source inbox of pushed batches
//!
//! Each accepted push becomes one sequenced batch, persisted through the
//! state store together with the push receipt. Relay cursors are the sync
//! tokens `relay:{seq}`; sequence numbers are durable, so a cursor committed
//! before a restart still points at the right place afterwards.
//!
//! ## Design Notes
//!
//! - Committing cursor `n` for a calendar (through `commit_batch`) releases
//!   every batch up to `n` for it. The store deletes a batch once all the
//!   calendars with events in it have released it.
//! - At most `capacity` batches are pending per source; further pushes are
//!   refused until the controller catches up.
//! - Pushes for one source are serialized here so sequence numbers are
//!   assigned without gaps.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use calsync_core::domain::{
    parse_relay_cursor, relay_cursor, CalendarId, NormalizedEvent, RelayBatch, RelayReceipt,
    SourceId, SyncToken,
};
use calsync_core::ports::{FetchPage, ISyncStateStore, ProviderError};

use crate::error::RelayError;
use crate::types::{AgentAck, RejectedEvent};

/// Bounded, sequenced inbox shared by the agent channel and the relay feed
pub struct Inbox {
    store: Arc<dyn ISyncStateStore>,
    capacity: usize,
    push_locks: DashMap<SourceId, Arc<Mutex<()>>>,
}

impl Inbox {
    pub fn new(store: Arc<dyn ISyncStateStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            push_locks: DashMap::new(),
        }
    }

    fn push_lock(&self, source_id: &SourceId) -> Arc<Mutex<()>> {
        Arc::clone(self.push_locks.entry(source_id.clone()).or_default().value())
    }

    /// Ack previously returned for `agent_cursor`, if it was the last push
    pub async fn replay(
        &self,
        source_id: &SourceId,
        agent_cursor: &str,
    ) -> Result<Option<AgentAck>, RelayError> {
        let state = self.store.relay_state(source_id).await?;
        let ack = state
            .receipt_for(agent_cursor)
            .map(AgentAck::from_receipt)
            .transpose()?;
        Ok(ack)
    }

    /// Stores `events` as one batch and returns the ack
    ///
    /// A resend of the last agent cursor returns the original ack without
    /// storing anything.
    pub async fn accept(
        &self,
        source_id: &SourceId,
        agent_cursor: &str,
        events: Vec<NormalizedEvent>,
        rejected: Vec<RejectedEvent>,
    ) -> Result<AgentAck, RelayError> {
        let lock = self.push_lock(source_id);
        let _guard = lock.lock().await;

        let state = self.store.relay_state(source_id).await?;
        if let Some(receipt) = state.receipt_for(agent_cursor) {
            debug!(source = %source_id, agent_cursor, "Retransmitted batch, returning previous ack");
            return Ok(AgentAck::from_receipt(receipt)?);
        }

        let batch = if events.is_empty() {
            None
        } else {
            let pending = self.store.relay_pending(source_id).await?;
            if pending >= self.capacity {
                warn!(
                    source = %source_id,
                    capacity = self.capacity,
                    "Inbox full, refusing batch"
                );
                return Err(RelayError::InboxFull {
                    source_id: source_id.clone(),
                    capacity: self.capacity,
                });
            }
            Some(RelayBatch {
                source_id: source_id.clone(),
                seq: state.last_seq + 1,
                events,
                received_at: Utc::now(),
            })
        };

        let receipt = RelayReceipt {
            agent_cursor: agent_cursor.to_string(),
            seq: batch.as_ref().map(|b| b.seq),
            accepted: batch.as_ref().map_or(0, |b| b.events.len()),
            rejected,
        };
        self.store
            .append_relay_batch(source_id, &receipt, batch.as_ref())
            .await?;

        debug!(
            source = %source_id,
            seq = ?receipt.seq,
            accepted = receipt.accepted,
            rejected = receipt.rejected.len(),
            "Batch accepted"
        );
        Ok(AgentAck::from_receipt(&receipt)?)
    }

    /// Next batch after `token` for one calendar
    ///
    /// An empty page without a cursor means nothing is pending.
    pub async fn next_after(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
        token: Option<&SyncToken>,
    ) -> Result<FetchPage, ProviderError> {
        let after = match token {
            None => 0,
            Some(token) => parse_relay_cursor(token).ok_or_else(|| {
                ProviderError::InvalidToken(format!("not a relay cursor: {token}"))
            })?,
        };

        let storage = |e: anyhow::Error| ProviderError::Transient(format!("relay inbox: {e}"));
        let last_seq = self
            .store
            .relay_state(source_id)
            .await
            .map_err(storage)?
            .last_seq;
        if after > last_seq {
            return Err(ProviderError::InvalidToken(format!(
                "relay cursor {after} is ahead of the inbox ({last_seq})"
            )));
        }

        // The second batch only tells whether more are waiting
        let mut batches = self
            .store
            .relay_batches_after(source_id, after, 2)
            .await
            .map_err(storage)?
            .into_iter();
        let Some(batch) = batches.next() else {
            return Ok(FetchPage::default());
        };
        let next_token =
            relay_cursor(batch.seq).map_err(|e| ProviderError::Transient(e.to_string()))?;

        Ok(FetchPage {
            events: batch
                .events
                .into_iter()
                .filter(|event| &event.calendar_id == calendar_id)
                .collect(),
            removed: Vec::new(),
            next_token: Some(next_token),
            has_more: batches.next().is_some(),
        })
    }

    /// Batches waiting for at least one calendar of `source_id`
    pub async fn pending(&self, source_id: &SourceId) -> Result<usize, RelayError> {
        Ok(self.store.relay_pending(source_id).await?)
    }
}
