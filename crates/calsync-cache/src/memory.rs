//! In-process implementation of ISyncStateStore
//!
//! Holds the whole state behind one `tokio::sync::RwLock`. Each trait call
//! takes the lock once, so multi-row writes such as
//! [`ISyncStateStore::commit_batch`] are applied atomically with respect to
//! every other call.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use calsync_core::domain::{
    newtypes::{AgentId, CalendarId, SourceId, SyncToken},
    parse_relay_cursor, AgentRegistration, AuthState, BatchCommit, DedupChange, DedupEntry,
    GlobalSettings, RelayBatch, RelayReceipt, RelayState, SyncConfiguration, SyncDestination,
    SyncSource,
};
use calsync_core::ports::ISyncStateStore;

use crate::CacheError;

#[derive(Default)]
struct MemoryState {
    config: SyncConfiguration,
    /// Keyed by `(destination calendar, dedup key)`
    dedup: HashMap<(CalendarId, String), DedupEntry>,
    relay: HashMap<SourceId, RelayInbox>,
}

#[derive(Default)]
struct RelayInbox {
    state: RelayState,
    /// Unreleased batches with the calendars still to consume them
    batches: BTreeMap<u64, (RelayBatch, BTreeSet<CalendarId>)>,
}

impl RelayInbox {
    fn release(&mut self, calendar_id: &CalendarId, up_to: u64) {
        for (_, (_, waiting)) in self.batches.range_mut(..=up_to) {
            waiting.remove(calendar_id);
        }
        self.batches.retain(|_, (_, waiting)| !waiting.is_empty());
    }
}

impl MemoryState {
    fn source_mut(&mut self, id: &SourceId) -> Result<&mut SyncSource, CacheError> {
        self.config
            .sources
            .iter_mut()
            .find(|s| s.id() == id)
            .ok_or_else(|| CacheError::UnknownSource(id.to_string()))
    }

    fn apply_dedup(&mut self, change: &DedupChange) {
        match change {
            DedupChange::Upsert(entry) => {
                self.dedup.insert(
                    (entry.dest_calendar_id.clone(), entry.dedup_key.clone()),
                    entry.clone(),
                );
            }
            DedupChange::Remove {
                dest_calendar_id,
                dedup_key,
            } => {
                self.dedup
                    .remove(&(dest_calendar_id.clone(), dedup_key.clone()));
            }
        }
    }
}

/// `ISyncStateStore` kept entirely in memory
#[derive(Default)]
pub struct MemoryStateStore {
    state: RwLock<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing configuration (e.g. one loaded from YAML)
    pub fn with_configuration(config: SyncConfiguration) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                config,
                ..MemoryState::default()
            }),
        }
    }

    /// Number of dedup entries across all destination calendars
    pub async fn dedup_len(&self) -> usize {
        self.state.read().await.dedup.len()
    }
}

#[async_trait::async_trait]
impl ISyncStateStore for MemoryStateStore {
    async fn get_configuration(&self) -> anyhow::Result<SyncConfiguration> {
        Ok(self.state.read().await.config.clone())
    }

    async fn get_source(&self, id: &SourceId) -> anyhow::Result<Option<SyncSource>> {
        Ok(self.state.read().await.config.source(id).cloned())
    }

    async fn upsert_source(&self, source: &SyncSource) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        match state.source_mut(source.id()) {
            Ok(existing) => {
                let mut replacement = source.clone();
                replacement.inherit_state(existing);
                *existing = replacement;
            }
            Err(_) => state.config.sources.push(source.clone()),
        }
        Ok(())
    }

    async fn remove_source(&self, id: &SourceId) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        let before = state.config.sources.len();
        state.config.sources.retain(|s| s.id() != id);
        let removed = state.config.sources.len() != before;
        state.dedup.retain(|_, entry| &entry.source_id != id);
        state.relay.remove(id);
        Ok(removed)
    }

    async fn set_destination(&self, destination: &SyncDestination) -> anyhow::Result<()> {
        self.state.write().await.config.destination = Some(destination.clone());
        Ok(())
    }

    async fn get_destination(&self) -> anyhow::Result<Option<SyncDestination>> {
        Ok(self.state.read().await.config.destination.clone())
    }

    async fn update_global_settings(&self, settings: &GlobalSettings) -> anyhow::Result<()> {
        self.state.write().await.config.global_settings = settings.clone();
        Ok(())
    }

    async fn get_token(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
    ) -> anyhow::Result<Option<SyncToken>> {
        let state = self.state.read().await;
        Ok(state
            .config
            .source(source_id)
            .and_then(|s| s.token(calendar_id))
            .cloned())
    }

    async fn commit_token(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
        token: &SyncToken,
        last_sync: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state
            .source_mut(source_id)?
            .record_commit(calendar_id, Some(token.clone()), last_sync);
        Ok(())
    }

    async fn clear_token(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if let Ok(source) = state.source_mut(source_id) {
            source.clear_token(calendar_id);
        }
        Ok(())
    }

    async fn set_auth_state(&self, source_id: &SourceId, auth: AuthState) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.source_mut(source_id)?.set_auth_state(auth);
        Ok(())
    }

    async fn dedup_lookup(
        &self,
        dest_calendar_id: &CalendarId,
        dedup_key: &str,
    ) -> anyhow::Result<Option<DedupEntry>> {
        let state = self.state.read().await;
        Ok(state
            .dedup
            .get(&(dest_calendar_id.clone(), dedup_key.to_string()))
            .cloned())
    }

    async fn dedup_upsert(&self, entry: &DedupEntry) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.apply_dedup(&DedupChange::Upsert(entry.clone()));
        Ok(())
    }

    async fn dedup_remove(
        &self,
        dest_calendar_id: &CalendarId,
        dedup_key: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.apply_dedup(&DedupChange::Remove {
            dest_calendar_id: dest_calendar_id.clone(),
            dedup_key: dedup_key.to_string(),
        });
        Ok(())
    }

    async fn dedup_entries_for(
        &self,
        dest_calendar_id: &CalendarId,
        source_id: &SourceId,
        source_calendar_id: &CalendarId,
    ) -> anyhow::Result<Vec<DedupEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<DedupEntry> = state
            .dedup
            .values()
            .filter(|e| {
                &e.dest_calendar_id == dest_calendar_id
                    && &e.source_id == source_id
                    && &e.source_calendar_id == source_calendar_id
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.dedup_key.cmp(&b.dedup_key));
        Ok(entries)
    }

    async fn commit_batch(&self, commit: &BatchCommit) -> anyhow::Result<()> {
        if commit.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().await;
        // Checked before anything is applied so a failed commit changes nothing
        state.source_mut(&commit.source_id)?;

        for change in &commit.dedup {
            state.apply_dedup(change);
        }
        let source = state.source_mut(&commit.source_id)?;
        match commit.last_sync {
            Some(last_sync) => {
                source.record_commit(&commit.calendar_id, commit.token.clone(), last_sync)
            }
            None => {
                if let Some(ref token) = commit.token {
                    source.store_token(&commit.calendar_id, token.clone());
                }
            }
        }
        if let Some(seq) = commit.token.as_ref().and_then(parse_relay_cursor) {
            if let Some(inbox) = state.relay.get_mut(&commit.source_id) {
                inbox.release(&commit.calendar_id, seq);
            }
        }
        Ok(())
    }

    async fn relay_state(&self, source_id: &SourceId) -> anyhow::Result<RelayState> {
        let state = self.state.read().await;
        Ok(state
            .relay
            .get(source_id)
            .map(|inbox| inbox.state.clone())
            .unwrap_or_default())
    }

    async fn append_relay_batch(
        &self,
        source_id: &SourceId,
        receipt: &RelayReceipt,
        batch: Option<&RelayBatch>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let inbox = state.relay.entry(source_id.clone()).or_default();
        if let Some(batch) = batch {
            let expected = inbox.state.last_seq + 1;
            if batch.seq != expected {
                return Err(CacheError::RelaySequence {
                    source_id: source_id.to_string(),
                    expected,
                    got: batch.seq,
                }
                .into());
            }
            inbox.state.last_seq = batch.seq;
            inbox
                .batches
                .insert(batch.seq, (batch.clone(), batch.calendars()));
        }
        inbox.state.last_receipt = Some(receipt.clone());
        Ok(())
    }

    async fn relay_batches_after(
        &self,
        source_id: &SourceId,
        after: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<RelayBatch>> {
        let state = self.state.read().await;
        Ok(state
            .relay
            .get(source_id)
            .map(|inbox| {
                inbox
                    .batches
                    .range(after.saturating_add(1)..)
                    .take(limit)
                    .map(|(_, (batch, _))| batch.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn relay_pending(&self, source_id: &SourceId) -> anyhow::Result<usize> {
        let state = self.state.read().await;
        Ok(state.relay.get(source_id).map_or(0, |inbox| inbox.batches.len()))
    }

    async fn upsert_agent(&self, agent: &AgentRegistration) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        match state.config.agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent.clone(),
            None => state.config.agents.push(agent.clone()),
        }
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> anyhow::Result<Option<AgentRegistration>> {
        let state = self.state.read().await;
        Ok(state.config.agents.iter().find(|a| &a.id == id).cloned())
    }

    async fn list_agents(&self) -> anyhow::Result<Vec<AgentRegistration>> {
        Ok(self.state.read().await.config.agents.clone())
    }

    async fn remove_agent(&self, id: &AgentId) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        let before = state.config.agents.len();
        state.config.agents.retain(|a| &a.id != id);
        Ok(state.config.agents.len() != before)
    }

    async fn record_agent_check_in(&self, id: &AgentId, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let agent = state
            .config
            .agents
            .iter_mut()
            .find(|a| &a.id == id)
            .ok_or_else(|| CacheError::UnknownAgent(id.to_string()))?;
        agent.last_check_in = Some(at);
        Ok(())
    }
}
