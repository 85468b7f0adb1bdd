//! Agent-facing surface: registration, pushes and heartbeats
//!
//! ## Design Notes
//!
//! - Agents authenticate with a bearer; the channel hashes it and looks up
//!   the matching enabled registration. The bearer itself is never stored.
//! - Every authenticated push or heartbeat counts as a check-in, including
//!   pushes that are then refused.
//! - Pushed events are only parked here, in the state store's relay inbox.
//!   The sync controller reads them through [`RelayFeed`] during a regular
//!   pass of the relayed source, so an acked batch survives a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use calsync_core::config::RelayConfig;
use calsync_core::domain::{
    AgentId, AgentRegistration, DomainError, SourceId, SyncSource,
    DEFAULT_AGENT_INTERVAL_MINUTES,
};
use calsync_core::ports::ISyncStateStore;

use crate::credential::{generate_bearer, hash_bearer};
use crate::error::RelayError;
use crate::feed::RelayFeed;
use crate::inbox::Inbox;
use crate::types::{AgentAck, AgentBatch, AgentHealth, RejectedEvent};

/// Receives event batches from remote agents
pub struct AgentChannel {
    store: Arc<dyn ISyncStateStore>,
    inbox: Arc<Inbox>,
    max_batch_events: usize,
}

impl AgentChannel {
    pub fn new(store: Arc<dyn ISyncStateStore>, config: &RelayConfig) -> Self {
        Self {
            inbox: Arc::new(Inbox::new(Arc::clone(&store), config.max_pending_batches)),
            store,
            max_batch_events: config.max_batch_events,
        }
    }

    /// Feed for `SyncController::with_feed`
    pub fn feed(&self) -> RelayFeed {
        RelayFeed::new(Arc::clone(&self.inbox))
    }

    /// Batches not yet consumed by every calendar of `source_id`
    pub async fn pending(&self, source_id: &SourceId) -> Result<usize, RelayError> {
        self.inbox.pending(source_id).await
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Registers an agent for a relayed source
    ///
    /// Returns the registration and the bearer credential. The bearer is
    /// not recoverable afterwards.
    #[tracing::instrument(skip(self, environment, agent_type))]
    pub async fn register_agent(
        &self,
        name: &str,
        environment: &str,
        agent_type: &str,
        source_id: &SourceId,
        interval_minutes: Option<u32>,
    ) -> Result<(AgentRegistration, String), RelayError> {
        if name.trim().is_empty() {
            return Err(DomainError::ValidationFailed("agent name is empty".to_string()).into());
        }
        let interval_minutes = interval_minutes.unwrap_or(DEFAULT_AGENT_INTERVAL_MINUTES);
        if interval_minutes == 0 {
            return Err(DomainError::ValidationFailed(
                "agent interval must be at least one minute".to_string(),
            )
            .into());
        }
        self.relayed_source(source_id).await?;

        let bearer = generate_bearer();
        let agent = AgentRegistration {
            id: AgentId::new(),
            name: name.to_string(),
            environment: environment.to_string(),
            agent_type: agent_type.to_string(),
            source_id: source_id.clone(),
            interval_minutes,
            credential_hash: hash_bearer(&bearer),
            registered_at: Utc::now(),
            last_check_in: None,
            enabled: true,
        };
        self.store.upsert_agent(&agent).await?;

        info!(agent = %agent.id, source = %source_id, "Agent registered");
        Ok((agent, bearer))
    }

    /// Removes an agent; its bearer stops working immediately
    pub async fn revoke_agent(&self, id: &AgentId) -> Result<bool, RelayError> {
        let removed = self.store.remove_agent(id).await?;
        if removed {
            info!(agent = %id, "Agent revoked");
        }
        Ok(removed)
    }

    // ========================================================================
    // Agent calls
    // ========================================================================

    /// Accepts a batch of events from an agent
    #[tracing::instrument(skip(self, bearer, batch), fields(source = %batch.source_id, events = batch.events.len()))]
    pub async fn push(&self, bearer: &str, batch: AgentBatch) -> Result<AgentAck, RelayError> {
        let agent = self.authenticate(bearer).await?;
        if agent.source_id != batch.source_id {
            warn!(agent = %agent.id, "Push for a source the agent is not bound to");
            return Err(RelayError::Forbidden {
                agent: agent.id,
                source_id: batch.source_id,
            });
        }
        self.store.record_agent_check_in(&agent.id, Utc::now()).await?;

        if let Some(ack) = self.inbox.replay(&batch.source_id, &batch.agent_cursor).await? {
            debug!(agent_cursor = %batch.agent_cursor, "Retransmitted batch");
            return Ok(ack);
        }
        if batch.events.len() > self.max_batch_events {
            return Err(RelayError::BatchTooLarge {
                len: batch.events.len(),
                max: self.max_batch_events,
            });
        }

        let source = self.relayed_source(&batch.source_id).await?;
        let mut accepted = Vec::with_capacity(batch.events.len());
        let mut rejected = Vec::new();
        for event in batch.events {
            let reason = match event.validate() {
                Err(err) => Some(err.to_string()),
                Ok(()) if !source.has_calendar(&event.calendar_id) => Some(format!(
                    "calendar {} is not configured on source {}",
                    event.calendar_id,
                    source.id()
                )),
                Ok(()) => None,
            };
            match reason {
                Some(reason) => rejected.push(RejectedEvent {
                    provider_event_id: event.provider_event_id,
                    reason,
                }),
                None => accepted.push(event),
            }
        }
        if !rejected.is_empty() {
            warn!(rejected = rejected.len(), "Rejected events in pushed batch");
        }

        self.inbox
            .accept(&batch.source_id, &batch.agent_cursor, accepted, rejected)
            .await
    }

    /// Check-in without events
    pub async fn heartbeat(&self, bearer: &str) -> Result<(), RelayError> {
        let agent = self.authenticate(bearer).await?;
        self.store.record_agent_check_in(&agent.id, Utc::now()).await?;
        debug!(agent = %agent.id, "Agent heartbeat");
        Ok(())
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Health of every registered agent at `now`
    pub async fn agent_health(&self, now: DateTime<Utc>) -> Result<Vec<AgentHealth>, RelayError> {
        let agents = self.store.list_agents().await?;
        Ok(agents
            .into_iter()
            .map(|agent| AgentHealth {
                status: agent.status_at(now),
                agent_id: agent.id,
                name: agent.name,
                source_id: agent.source_id,
                last_check_in: agent.last_check_in,
            })
            .collect())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn authenticate(&self, bearer: &str) -> Result<AgentRegistration, RelayError> {
        let hash = hash_bearer(bearer);
        self.store
            .list_agents()
            .await?
            .into_iter()
            .find(|agent| agent.enabled && agent.credential_hash == hash)
            .ok_or(RelayError::Unauthorized)
    }

    async fn relayed_source(
        &self,
        source_id: &SourceId,
    ) -> Result<SyncSource, RelayError> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or_else(|| RelayError::UnknownSource(source_id.clone()))?;
        if !source.is_relayed() {
            return Err(RelayError::NotRelayed(source_id.clone()));
        }
        Ok(source)
    }
}
