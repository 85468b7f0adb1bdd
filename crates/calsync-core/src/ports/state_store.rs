//! Sync state store port (driven/secondary port)
//!
//! Persists the configuration, per-`(source, calendar)` sync tokens,
//! `last_sync` timestamps, registered agents, the dedup index and the relay
//! inbox of agent-pushed batches.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, in-process) and surface as [`ErrorKind::Storage`] in results.
//! - A token and its `last_sync` are always written together;
//!   [`ISyncStateStore::commit_batch`] extends that to the dedup changes of a
//!   page. Implementations must apply each call atomically.
//! - Dedup keys are partitioned by source, so concurrent passes for
//!   different sources never touch the same row.
//! - Relay batches are released by `commit_batch`: a committed relay cursor
//!   marks every batch up to it as consumed by that calendar, and a batch
//!   consumed by all of its calendars is deleted in the same transaction.
//!
//! [`ErrorKind::Storage`]: crate::domain::ErrorKind::Storage

use chrono::{DateTime, Utc};

use crate::domain::{
    newtypes::{AgentId, CalendarId, DestEventId, SourceId, SyncToken},
    AgentRegistration, AuthState, BatchCommit, DedupEntry, GlobalSettings, RelayBatch,
    RelayReceipt, RelayState, SyncConfiguration, SyncDestination, SyncSource,
};

/// Persistent sync state
#[async_trait::async_trait]
pub trait ISyncStateStore: Send + Sync {
    // --- Configuration ---

    /// Whole configuration snapshot
    async fn get_configuration(&self) -> anyhow::Result<SyncConfiguration>;

    /// Single source lookup
    async fn get_source(&self, id: &SourceId) -> anyhow::Result<Option<SyncSource>>;

    /// Insert or replace a source's configuration fields
    ///
    /// Stored tokens, `last_sync` and auth state of an existing source are
    /// kept (see [`SyncSource::inherit_state`]).
    async fn upsert_source(&self, source: &SyncSource) -> anyhow::Result<()>;

    /// Remove a source with its tokens, dedup entries and relay inbox;
    /// returns whether it existed
    async fn remove_source(&self, id: &SourceId) -> anyhow::Result<bool>;

    /// Replace the destination
    async fn set_destination(&self, destination: &SyncDestination) -> anyhow::Result<()>;

    async fn get_destination(&self) -> anyhow::Result<Option<SyncDestination>>;

    async fn update_global_settings(&self, settings: &GlobalSettings) -> anyhow::Result<()>;

    // --- Tokens ---

    async fn get_token(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
    ) -> anyhow::Result<Option<SyncToken>>;

    /// Store the token and `last_sync` for one calendar together
    async fn commit_token(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
        token: &SyncToken,
        last_sync: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Forget the token for one calendar (next fetch is a full fetch)
    async fn clear_token(&self, source_id: &SourceId, calendar_id: &CalendarId)
        -> anyhow::Result<()>;

    async fn set_auth_state(&self, source_id: &SourceId, state: AuthState) -> anyhow::Result<()>;

    // --- Dedup index ---

    async fn dedup_lookup(
        &self,
        dest_calendar_id: &CalendarId,
        dedup_key: &str,
    ) -> anyhow::Result<Option<DedupEntry>>;

    async fn dedup_upsert(&self, entry: &DedupEntry) -> anyhow::Result<()>;

    async fn dedup_remove(&self, dest_calendar_id: &CalendarId, dedup_key: &str)
        -> anyhow::Result<()>;

    /// Every entry produced from one source calendar into one destination
    /// calendar
    async fn dedup_entries_for(
        &self,
        dest_calendar_id: &CalendarId,
        source_id: &SourceId,
        source_calendar_id: &CalendarId,
    ) -> anyhow::Result<Vec<DedupEntry>>;

    /// Apply a page's dedup changes, token and `last_sync` atomically
    ///
    /// When the token is a relay cursor, relay batches up to it are released
    /// for the calendar in the same transaction.
    async fn commit_batch(&self, commit: &BatchCommit) -> anyhow::Result<()>;

    // --- Relay inbox ---

    /// Last assigned sequence and last push receipt of a source
    async fn relay_state(&self, source_id: &SourceId) -> anyhow::Result<RelayState>;

    /// Record a push: store `batch` (if any events were accepted) and
    /// replace the source's receipt, atomically
    ///
    /// `batch.seq` must be exactly one past the stored `last_seq`.
    async fn append_relay_batch(
        &self,
        source_id: &SourceId,
        receipt: &RelayReceipt,
        batch: Option<&RelayBatch>,
    ) -> anyhow::Result<()>;

    /// Up to `limit` unreleased batches with `seq > after`, oldest first
    async fn relay_batches_after(
        &self,
        source_id: &SourceId,
        after: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<RelayBatch>>;

    /// Batches not yet consumed by every calendar they touch
    async fn relay_pending(&self, source_id: &SourceId) -> anyhow::Result<usize>;

    // --- Agents ---

    async fn upsert_agent(&self, agent: &AgentRegistration) -> anyhow::Result<()>;

    async fn get_agent(&self, id: &AgentId) -> anyhow::Result<Option<AgentRegistration>>;

    async fn list_agents(&self) -> anyhow::Result<Vec<AgentRegistration>>;

    async fn remove_agent(&self, id: &AgentId) -> anyhow::Result<bool>;

    async fn record_agent_check_in(&self, id: &AgentId, at: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Resolves the destination event id recorded for a key, if any
///
/// Convenience over [`ISyncStateStore::dedup_lookup`] for callers that only
/// need the id.
pub async fn dedup_event_id(
    store: &dyn ISyncStateStore,
    dest_calendar_id: &CalendarId,
    dedup_key: &str,
) -> anyhow::Result<Option<DestEventId>> {
    Ok(store
        .dedup_lookup(dest_calendar_id, dedup_key)
        .await?
        .map(|entry| entry.dest_event_id))
}
