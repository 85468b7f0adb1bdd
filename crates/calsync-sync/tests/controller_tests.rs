//! Integration tests for SyncController
//!
//! Passes run against [`MemoryStateStore`] with hand-written provider and
//! credential mocks. The source mock serves its current event set on every
//! fetch; the destination mock keeps written events in a map so tests can
//! inspect and edit them.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use calsync_cache::MemoryStateStore;
use calsync_core::config::{Config, ConfigBuilder};
use calsync_core::domain::{
    AuthState, CalendarId, ConflictPolicy, DestEventId, DestinationId, DomainError, ErrorKind,
    EventStatus, NormalizedEvent, ProviderType, SkipReason, SourceId, SyncConfiguration,
    SyncDestination, SyncDirection, SyncFrequency, SyncMethod, SyncSource, SyncStatus, SyncToken,
};
use calsync_core::ports::{
    Credential, CredentialError, FetchPage, FetchRequest, ICredentialProvider, IProviderAdapter,
    ISyncStateStore, ProviderError, ProviderRegistry,
};
use calsync_sync::{ControllerError, SyncController, SyncScheduler};

// ============================================================================
// Mock provider
// ============================================================================

/// Plays a source calendar (fetch) or the destination calendar (writes)
#[derive(Default)]
struct MockProvider {
    /// Events the source currently holds, in fetch order
    source_events: Mutex<Vec<NormalizedEvent>>,
    /// Ids reported as removed on delta fetches
    removed: Mutex<Vec<String>>,
    /// Scripted responses served before the current event set
    script: Mutex<VecDeque<Result<FetchPage, ProviderError>>>,
    requests: Mutex<Vec<FetchRequest>>,
    /// Fetches return no cursor when set
    no_tokens: bool,
    token_counter: AtomicU32,

    /// Events written to the destination, keyed by destination id
    written: Mutex<BTreeMap<String, NormalizedEvent>>,
    write_counter: AtomicU32,
    /// Provider event ids whose destination writes fail
    failing_writes: Mutex<HashSet<String>>,
    /// Credential references this provider rejects
    rejected: Mutex<HashSet<String>>,
    /// Cancelled right after the write of the given provider event id
    cancel_after_write: Mutex<Option<(String, CancellationToken)>>,
    /// `(entered, release)` pair that blocks fetches
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl MockProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn without_tokens() -> Arc<Self> {
        Arc::new(Self {
            no_tokens: true,
            ..Self::default()
        })
    }

    fn set_events(&self, events: Vec<NormalizedEvent>) {
        *self.source_events.lock().unwrap() = events;
    }

    fn replace_event(&self, event: NormalizedEvent) {
        let mut events = self.source_events.lock().unwrap();
        if let Some(slot) = events
            .iter_mut()
            .find(|e| e.provider_event_id == event.provider_event_id)
        {
            *slot = event;
        }
    }

    fn remove_event(&self, id: &str, report: bool) {
        self.source_events
            .lock()
            .unwrap()
            .retain(|e| e.provider_event_id != id);
        if report {
            self.removed.lock().unwrap().push(id.to_string());
        }
    }

    fn push_script(&self, response: Result<FetchPage, ProviderError>) {
        self.script.lock().unwrap().push_back(response);
    }

    fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn written(&self) -> Vec<NormalizedEvent> {
        self.written.lock().unwrap().values().cloned().collect()
    }

    fn written_for(&self, provider_event_id: &str) -> Option<NormalizedEvent> {
        self.written
            .lock()
            .unwrap()
            .values()
            .find(|e| e.provider_event_id == provider_event_id)
            .cloned()
    }

    /// Simulates an edit made directly in the destination
    fn touch(&self, provider_event_id: &str, title: &str, at: DateTime<Utc>) {
        let mut written = self.written.lock().unwrap();
        if let Some(event) = written
            .values_mut()
            .find(|e| e.provider_event_id == provider_event_id)
        {
            event.title = title.to_string();
            event.updated_at = at;
        }
    }

    fn fail_writes_for(&self, provider_event_id: &str) {
        self.failing_writes
            .lock()
            .unwrap()
            .insert(provider_event_id.to_string());
    }

    fn heal_writes(&self) {
        self.failing_writes.lock().unwrap().clear();
    }

    fn reject(&self, reference: &str) {
        self.rejected.lock().unwrap().insert(reference.to_string());
    }

    fn accept(&self, reference: &str) {
        self.rejected.lock().unwrap().remove(reference);
    }

    fn check_credential(&self, credential: &Credential) -> Result<(), ProviderError> {
        if self.rejected.lock().unwrap().contains(&credential.reference) {
            return Err(ProviderError::AuthExpired(format!(
                "token for {} rejected",
                credential.reference
            )));
        }
        Ok(())
    }

    fn next_token(&self) -> Option<SyncToken> {
        if self.no_tokens {
            return None;
        }
        let n = self.token_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Some(SyncToken::new(format!("tok-{n}")).unwrap())
    }
}

#[async_trait]
impl IProviderAdapter for MockProvider {
    async fn fetch_events(
        &self,
        credential: &Credential,
        _calendar_id: &CalendarId,
        request: &FetchRequest,
    ) -> Result<FetchPage, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        self.check_credential(credential)?;

        let gate = self.gate.lock().unwrap().clone();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }

        let removed = match request {
            FetchRequest::Delta(_) => std::mem::take(&mut *self.removed.lock().unwrap()),
            FetchRequest::Window { .. } => Vec::new(),
        };
        Ok(FetchPage {
            events: self.source_events.lock().unwrap().clone(),
            removed,
            next_token: self.next_token(),
            has_more: false,
        })
    }

    async fn write_event(
        &self,
        credential: &Credential,
        _calendar_id: &CalendarId,
        event: &NormalizedEvent,
    ) -> Result<DestEventId, ProviderError> {
        self.check_credential(credential)?;
        if self
            .failing_writes
            .lock()
            .unwrap()
            .contains(&event.provider_event_id)
        {
            return Err(ProviderError::Transient("connection reset".to_string()));
        }

        let n = self.write_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("dest-{n}");
        self.written
            .lock()
            .unwrap()
            .insert(id.clone(), event.clone());

        if let Some((after, token)) = self.cancel_after_write.lock().unwrap().as_ref() {
            if *after == event.provider_event_id {
                token.cancel();
            }
        }
        Ok(DestEventId::new(id).unwrap())
    }

    async fn update_event(
        &self,
        credential: &Credential,
        _calendar_id: &CalendarId,
        event_id: &DestEventId,
        event: &NormalizedEvent,
    ) -> Result<DestEventId, ProviderError> {
        self.check_credential(credential)?;
        let mut written = self.written.lock().unwrap();
        match written.get_mut(event_id.as_str()) {
            Some(slot) => {
                *slot = event.clone();
                Ok(event_id.clone())
            }
            None => Err(ProviderError::NotFound(event_id.to_string())),
        }
    }

    async fn get_event(
        &self,
        credential: &Credential,
        _calendar_id: &CalendarId,
        event_id: &DestEventId,
    ) -> Result<Option<NormalizedEvent>, ProviderError> {
        self.check_credential(credential)?;
        Ok(self.written.lock().unwrap().get(event_id.as_str()).cloned())
    }

    async fn delete_event(
        &self,
        credential: &Credential,
        _calendar_id: &CalendarId,
        event_id: &DestEventId,
    ) -> Result<(), ProviderError> {
        self.check_credential(credential)?;
        self.written.lock().unwrap().remove(event_id.as_str());
        Ok(())
    }
}

// ============================================================================
// Mock credentials
// ============================================================================

/// Credential per id; refresh hands back a new secret for the same reference
#[derive(Default)]
struct MockCredentials {
    refreshes: AtomicU32,
    /// Secrets stored by a re-authorization, keyed by source id
    stored: Mutex<BTreeMap<String, String>>,
}

impl MockCredentials {
    /// Simulates the user re-authorizing a source
    fn store_secret(&self, source_id: &str, secret: &str) {
        self.stored
            .lock()
            .unwrap()
            .insert(source_id.to_string(), secret.to_string());
    }
}

#[async_trait]
impl ICredentialProvider for MockCredentials {
    async fn resolve(&self, source_id: &SourceId) -> Result<Credential, CredentialError> {
        let secret = self
            .stored
            .lock()
            .unwrap()
            .get(source_id.as_str())
            .cloned()
            .unwrap_or_else(|| "secret".to_string());
        Ok(Credential::new(source_id.as_str(), secret))
    }

    async fn resolve_destination(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Credential, CredentialError> {
        Ok(Credential::new(destination_id.as_str(), "secret"))
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new(credential.reference.clone(), "refreshed"))
    }
}

// ============================================================================
// Test helpers
// ============================================================================

fn sid(s: &str) -> SourceId {
    SourceId::new(s.to_string()).unwrap()
}

fn cal(s: &str) -> CalendarId {
    CalendarId::new(s.to_string()).unwrap()
}

fn consolidated() -> CalendarId {
    cal("consolidated")
}

fn source(id: &str, name: &str) -> SyncSource {
    SyncSource::new(sid(id), name, ProviderType::Google)
        .with_calendars(vec![cal("primary")])
        .with_direction(SyncDirection::Bidirectional)
}

fn destination(policy: ConflictPolicy) -> SyncDestination {
    SyncDestination::new(
        DestinationId::new("main".to_string()).unwrap(),
        "Main",
        ProviderType::Microsoft,
        consolidated(),
    )
    .with_policy(policy)
}

/// An event at 09:00 UTC `day` days from today, last modified at `updated_at`
fn event(id: &str, title: &str, day: i64, updated_at: DateTime<Utc>) -> NormalizedEvent {
    let start = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc()
        + Duration::days(day)
        + Duration::hours(9);
    NormalizedEvent::new(
        ProviderType::Google,
        id,
        cal("primary"),
        title,
        start,
        start + Duration::hours(1),
        updated_at,
    )
}

/// Modification timestamps
fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn three_events() -> Vec<NormalizedEvent> {
    vec![
        event("evt-1", "Standup", 1, t(0)),
        event("evt-2", "Planning", 2, t(0)),
        event("evt-3", "Retro", 3, t(0)),
    ]
}

fn test_config() -> Config {
    ConfigBuilder::new()
        .retry_max_attempts(2)
        .retry_base_delay_ms(1)
        .retry_max_delay_ms(5)
        .build()
}

struct Harness {
    store: Arc<MemoryStateStore>,
    source: Arc<MockProvider>,
    dest: Arc<MockProvider>,
    credentials: Arc<MockCredentials>,
    controller: SyncController,
}

impl Harness {
    fn setup(sources: Vec<SyncSource>, policy: ConflictPolicy) -> Self {
        Self::with_source_provider(sources, Some(destination(policy)), MockProvider::new())
    }

    fn with_source_provider(
        sources: Vec<SyncSource>,
        destination: Option<SyncDestination>,
        source: Arc<MockProvider>,
    ) -> Self {
        let config = SyncConfiguration {
            sources,
            destination,
            ..SyncConfiguration::default()
        };
        let store = Arc::new(MemoryStateStore::with_configuration(config));
        let dest = MockProvider::new();
        let credentials = Arc::new(MockCredentials::default());
        let controller = Self::controller(&store, &source, &dest, &credentials);
        Self {
            store,
            source,
            dest,
            credentials,
            controller,
        }
    }

    fn controller(
        store: &Arc<MemoryStateStore>,
        source: &Arc<MockProvider>,
        dest: &Arc<MockProvider>,
        credentials: &Arc<MockCredentials>,
    ) -> SyncController {
        let providers = ProviderRegistry::new()
            .with(ProviderType::Google, Arc::clone(source) as Arc<dyn IProviderAdapter>)
            .with(ProviderType::Microsoft, Arc::clone(dest) as Arc<dyn IProviderAdapter>);
        SyncController::new(
            Arc::clone(store) as Arc<dyn ISyncStateStore>,
            providers,
            Arc::clone(credentials) as Arc<dyn ICredentialProvider>,
            &test_config(),
        )
    }

    /// A fresh controller over the same store and mocks (a daemon restart)
    fn restart(&mut self) {
        self.controller =
            Self::controller(&self.store, &self.source, &self.dest, &self.credentials);
    }

    async fn token(&self, source_id: &str) -> Option<SyncToken> {
        self.store
            .get_token(&sid(source_id), &cal("primary"))
            .await
            .unwrap()
    }
}

// ============================================================================
// First sync and idempotence
// ============================================================================

#[tokio::test]
async fn test_first_sync_creates_three_events() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());

    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.status, SyncStatus::Success);
    assert_eq!(result.sources_synced, 1);
    assert_eq!(result.counters.created, 3);
    assert_eq!(result.events_synced, 3);
    assert!(result.errors.is_empty());

    let written = h.dest.written();
    assert_eq!(written.len(), 3);
    for event in &written {
        let description = event.description.as_deref().unwrap();
        assert!(description.ends_with("Synced from: Work"));
        assert!(event.categories.contains(&"Work".to_string()));
        assert_eq!(event.color.as_deref(), Some(ProviderType::Google.default_color()));
        assert!(event.last_synced.is_some());
    }

    assert_eq!(h.token("work").await, Some(SyncToken::new("tok-1".into()).unwrap()));
    assert_eq!(h.store.dedup_len().await, 3);
    let stored = h.store.get_source(&sid("work")).await.unwrap().unwrap();
    assert!(stored.last_sync().is_some());
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());

    h.controller.run_source(&sid("work")).await.unwrap();
    let second = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(second.counters.created, 0);
    assert_eq!(second.counters.updated, 0);
    assert_eq!(second.counters.unchanged, 3);
    assert_eq!(h.dest.written().len(), 3);
    // Second fetch used the committed cursor
    assert_eq!(
        h.source.requests().last(),
        Some(&FetchRequest::Delta(SyncToken::new("tok-1".into()).unwrap()))
    );
}

#[tokio::test]
async fn test_existing_description_keeps_origin_after_blank_line() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    let mut described = event("evt-1", "Standup", 1, t(0));
    described.description = Some("Daily sync".to_string());
    h.source.set_events(vec![described]);

    h.controller.run_source(&sid("work")).await.unwrap();

    let written = h.dest.written_for("evt-1").unwrap();
    assert_eq!(
        written.description.as_deref(),
        Some("Daily sync\n\nSynced from: Work")
    );
}

#[tokio::test]
async fn test_paged_fetch_follows_cursor() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    let events = three_events();
    h.source.push_script(Ok(FetchPage {
        events: events[..2].to_vec(),
        removed: Vec::new(),
        next_token: Some(SyncToken::new("page-2".into()).unwrap()),
        has_more: true,
    }));
    h.source.push_script(Ok(FetchPage {
        events: events[2..].to_vec(),
        removed: Vec::new(),
        next_token: Some(SyncToken::new("final".into()).unwrap()),
        has_more: false,
    }));

    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.counters.created, 3);
    let requests = h.source.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].is_window());
    assert_eq!(
        requests[1],
        FetchRequest::Delta(SyncToken::new("page-2".into()).unwrap())
    );
    assert_eq!(h.token("work").await, Some(SyncToken::new("final".into()).unwrap()));
}

#[tokio::test]
async fn test_invalid_events_are_dropped_without_error() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    let mut broken = event("evt-bad", "Broken", 1, t(0));
    broken.end = broken.start - Duration::hours(1);
    h.source
        .set_events(vec![broken, event("evt-1", "Standup", 1, t(0))]);

    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.counters.created, 1);
    assert_eq!(result.counters.dropped, 1);
    assert!(result.errors.is_empty());
    assert!(h.token("work").await.is_some());
}

// ============================================================================
// Token safety
// ============================================================================

#[tokio::test]
async fn test_failed_write_keeps_token_and_rerun_does_not_duplicate() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.dest.fail_writes_for("evt-2");

    let first = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(first.status, SyncStatus::Partial);
    assert_eq!(first.counters.created, 2);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].kind, ErrorKind::Transient);
    assert!(h.token("work").await.is_none());
    assert_eq!(h.store.dedup_len().await, 2);

    h.dest.heal_writes();
    let second = h.controller.run_source(&sid("work")).await.unwrap();

    assert!(second.errors.is_empty());
    assert_eq!(second.counters.created, 1);
    assert_eq!(second.counters.unchanged, 2);
    assert_eq!(h.dest.written().len(), 3);
    assert!(h.token("work").await.is_some());
}

#[tokio::test]
async fn test_invalid_token_falls_back_to_window() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.controller.run_source(&sid("work")).await.unwrap();

    h.source
        .push_script(Err(ProviderError::InvalidToken("410 Gone".to_string())));
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert!(result.errors.is_empty());
    assert_eq!(result.counters.unchanged, 3);
    let requests = h.source.requests();
    let tail = &requests[requests.len() - 2..];
    assert!(matches!(tail[0], FetchRequest::Delta(_)));
    assert!(tail[1].is_window());
    assert_eq!(h.token("work").await, Some(SyncToken::new("tok-2".into()).unwrap()));
}

// ============================================================================
// Conflict policies
// ============================================================================

#[tokio::test]
async fn test_latest_wins_newer_source_overwrites() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::LatestWins);
    h.source.set_events(vec![event("evt-1", "Standup", 1, t(0))]);
    h.controller.run_source(&sid("work")).await.unwrap();

    h.source
        .replace_event(event("evt-1", "Standup (moved)", 1, t(10)));
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.counters.updated, 1);
    assert_eq!(h.dest.written_for("evt-1").unwrap().title, "Standup (moved)");
    assert_eq!(h.dest.written().len(), 1);
}

#[tokio::test]
async fn test_latest_wins_newer_destination_is_kept() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::LatestWins);
    h.source.set_events(vec![event("evt-1", "Standup", 1, t(0))]);
    h.controller.run_source(&sid("work")).await.unwrap();

    h.dest.touch("evt-1", "Edited in destination", t(20));
    h.source
        .replace_event(event("evt-1", "Standup (moved)", 1, t(10)));
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.counters.updated, 0);
    assert_eq!(result.counters.dropped, 1);
    assert_eq!(
        h.dest.written_for("evt-1").unwrap().title,
        "Edited in destination"
    );

    // The kept decision is not re-evaluated on the next pass
    let again = h.controller.run_source(&sid("work")).await.unwrap();
    assert_eq!(again.counters.unchanged, 1);
}

#[tokio::test]
async fn test_latest_wins_tie_keeps_destination() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::LatestWins);
    h.source.set_events(vec![event("evt-1", "Standup", 1, t(0))]);
    h.controller.run_source(&sid("work")).await.unwrap();

    let same = t(10);
    h.dest.touch("evt-1", "Edited in destination", same);
    h.source
        .replace_event(event("evt-1", "Standup (moved)", 1, same));
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.counters.updated, 0);
    assert_eq!(
        h.dest.written_for("evt-1").unwrap().title,
        "Edited in destination"
    );
}

#[tokio::test]
async fn test_destination_wins_ignores_upstream_change() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::DestinationWins);
    h.source.set_events(vec![event("evt-1", "Standup", 1, t(0))]);
    h.controller.run_source(&sid("work")).await.unwrap();
    let writes = h.dest.write_counter.load(Ordering::SeqCst);

    h.source
        .replace_event(event("evt-1", "Standup (moved)", 1, t(10)));
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert!(result.errors.is_empty());
    assert_eq!(result.counters.updated, 0);
    assert_eq!(result.counters.dropped, 1);
    assert_eq!(h.dest.written_for("evt-1").unwrap().title, "Standup");

    // The upstream version is now the known one; nothing left to decide
    let again = h.controller.run_source(&sid("work")).await.unwrap();
    assert_eq!(again.counters.unchanged, 1);
    assert_eq!(again.counters.created + again.counters.updated, 0);
    assert_eq!(h.dest.write_counter.load(Ordering::SeqCst), writes);
    assert_eq!(h.dest.written_for("evt-1").unwrap().title, "Standup");
}

#[tokio::test]
async fn test_changed_event_missing_in_destination_is_recreated() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(vec![event("evt-1", "Standup", 1, t(0))]);
    h.controller.run_source(&sid("work")).await.unwrap();

    h.dest.written.lock().unwrap().clear();
    h.source
        .replace_event(event("evt-1", "Standup (moved)", 1, t(10)));
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert!(result.errors.is_empty());
    assert_eq!(result.counters.created, 1);
    assert_eq!(h.dest.written_for("evt-1").unwrap().title, "Standup (moved)");
}

#[tokio::test]
async fn test_manual_policy_records_conflict_each_pass() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::Manual);
    h.source.set_events(vec![event("evt-1", "Standup", 1, t(0))]);
    h.controller.run_source(&sid("work")).await.unwrap();

    h.source
        .replace_event(event("evt-1", "Standup (moved)", 1, t(10)));
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert!(result.errors.is_empty());
    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert_eq!(conflict.source_id, sid("work"));
    assert_eq!(conflict.provider_event_id, "evt-1");
    assert_eq!(conflict.dest_calendar_id, consolidated());
    assert_eq!(conflict.incoming_updated_at, t(10));
    assert_eq!(h.dest.written_for("evt-1").unwrap().title, "Standup");

    let again = h.controller.run_source(&sid("work")).await.unwrap();
    assert_eq!(again.conflicts.len(), 1);
}

// ============================================================================
// Removals
// ============================================================================

#[tokio::test]
async fn test_removed_event_is_deleted_for_bidirectional_source() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.controller.run_source(&sid("work")).await.unwrap();

    h.source.remove_event("evt-1", true);
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.counters.deleted, 1);
    assert_eq!(h.dest.written().len(), 2);
    assert!(h.dest.written_for("evt-1").is_none());
    assert_eq!(h.store.dedup_len().await, 2);
}

#[tokio::test]
async fn test_read_only_source_never_deletes() {
    let read_only = source("work", "Work").with_direction(SyncDirection::ReadOnly);
    let h = Harness::setup(vec![read_only], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.controller.run_source(&sid("work")).await.unwrap();

    h.source.remove_event("evt-1", true);
    let mut cancelled = event("evt-2", "Planning", 2, t(5));
    cancelled.status = EventStatus::Cancelled;
    h.source.replace_event(cancelled);
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.counters.deleted, 0);
    assert_eq!(result.counters.dropped, 2);
    assert_eq!(h.dest.written().len(), 3);
    assert_eq!(h.store.dedup_len().await, 3);
}

#[tokio::test]
async fn test_cancelled_status_deletes_destination_copy() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.controller.run_source(&sid("work")).await.unwrap();

    let mut cancelled = event("evt-3", "Retro", 3, t(5));
    cancelled.status = EventStatus::Cancelled;
    h.source.replace_event(cancelled);
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.counters.deleted, 1);
    assert!(h.dest.written_for("evt-3").is_none());
}

#[tokio::test]
async fn test_event_absent_from_window_snapshot_is_deleted() {
    let h = Harness::with_source_provider(
        vec![source("work", "Work")],
        Some(destination(ConflictPolicy::SourceWins)),
        MockProvider::without_tokens(),
    );
    h.source.set_events(three_events());
    h.controller.run_source(&sid("work")).await.unwrap();

    // Silently gone: only a full fetch can notice
    h.source.remove_event("evt-2", false);
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert!(h.source.requests().iter().all(FetchRequest::is_window));
    assert_eq!(result.counters.deleted, 1);
    assert_eq!(result.counters.unchanged, 2);
    assert!(h.dest.written_for("evt-2").is_none());
}

// ============================================================================
// Credentials
// ============================================================================

#[tokio::test]
async fn test_auth_expired_is_isolated_to_one_source() {
    let h = Harness::setup(
        vec![source("work", "Work"), source("home", "Home")],
        ConflictPolicy::SourceWins,
    );
    h.source.set_events(three_events());
    h.source.reject("work");

    let result = h.controller.run_all().await.unwrap();

    assert_eq!(result.status, SyncStatus::Partial);
    assert_eq!(result.sources_synced, 1);
    assert_eq!(result.counters.created, 3);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].source_id, sid("work"));
    assert_eq!(result.errors[0].kind, ErrorKind::AuthExpired);
    assert_eq!(result.errors_of(ErrorKind::AuthExpired).count(), 1);

    // One refresh, one retry, then the source is flagged
    assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);
    let work = h.store.get_source(&sid("work")).await.unwrap().unwrap();
    assert_eq!(work.auth_state(), AuthState::NeedsReauth);
    assert!(h.token("work").await.is_none());
}

#[tokio::test]
async fn test_flagged_source_is_skipped_without_provider_calls() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.source.reject("work");
    h.controller.run_source(&sid("work")).await.unwrap();
    let fetches = h.source.requests().len();

    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.sources_synced, 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::AuthExpired);
    assert_eq!(h.source.requests().len(), fetches);
    assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);
    let work = h.store.get_source(&sid("work")).await.unwrap().unwrap();
    assert_eq!(work.auth_state(), AuthState::NeedsReauth);
}

#[tokio::test]
async fn test_new_credential_clears_reauth_flag() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.source.reject("work");
    h.controller.run_source(&sid("work")).await.unwrap();

    h.credentials.store_secret("work", "renewed");
    h.source.accept("work");
    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert!(result.errors.is_empty());
    assert_eq!(result.counters.created, 3);
    assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);
    let work = h.store.get_source(&sid("work")).await.unwrap().unwrap();
    assert_eq!(work.auth_state(), AuthState::Ok);
}

#[tokio::test]
async fn test_destination_auth_expired_aborts_pass() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.dest.reject("main");

    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.sources_synced, 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::AuthExpired);
    assert!(h.dest.written().is_empty());
    assert!(h.token("work").await.is_none());
}

// ============================================================================
// Concurrency and cancellation
// ============================================================================

#[tokio::test]
async fn test_concurrent_pass_is_busy() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    *h.source.gate.lock().unwrap() = Some((Arc::clone(&entered), Arc::clone(&release)));

    let work = sid("work");
    let first = h.controller.run_source(&work);
    let second = async {
        entered.notified().await;
        assert!(h.controller.is_busy(&work));

        let busy = h.controller.run_source(&work).await;
        let all = h.controller.run_all().await.unwrap();

        *h.source.gate.lock().unwrap() = None;
        release.notify_one();
        (busy, all)
    };

    let (first, (busy, all)) = tokio::join!(first, second);

    assert_eq!(first.unwrap().counters.created, 3);
    assert!(matches!(busy, Err(ControllerError::Busy(_))));
    assert_eq!(all.skipped.len(), 1);
    assert_eq!(all.skipped[0].reason, SkipReason::Busy);
    assert!(all.errors.is_empty());
    assert!(!h.controller.is_busy(&sid("work")));
}

#[tokio::test]
async fn test_slow_scheduled_pass_does_not_hold_up_trigger() {
    let home = source("home", "Home")
        .with_direction(SyncDirection::WriteOnly)
        .with_frequency(SyncFrequency::Manual);
    let h = Harness::setup(
        vec![source("work", "Work").with_frequency(SyncFrequency::Hourly), home],
        ConflictPolicy::SourceWins,
    );
    h.source.set_events(three_events());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    *h.source.gate.lock().unwrap() = Some((Arc::clone(&entered), Arc::clone(&release)));

    let controller = Arc::new(Harness::controller(
        &h.store,
        &h.source,
        &h.dest,
        &h.credentials,
    ));
    let scheduler = SyncScheduler::new(Arc::clone(&controller), &test_config());
    let handle = scheduler.handle();
    let shutdown = CancellationToken::new();

    let driver = async {
        // The first tick starts work, which blocks in its fetch
        entered.notified().await;
        assert!(handle.trigger(sid("home")).await);

        let mut attempts = 0;
        while controller.source_history(&sid("home")).await.is_empty() {
            attempts += 1;
            assert!(attempts < 200, "triggered pass waited for the blocked one");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(controller.is_busy(&sid("work")));

        *h.source.gate.lock().unwrap() = None;
        release.notify_one();
        while controller.source_history(&sid("work")).await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        shutdown.cancel();
    };

    tokio::join!(scheduler.run(shutdown.clone()), driver);

    let work = controller.source_history(&sid("work")).await;
    assert_eq!(work[0].counters.created, 3);
    assert!(controller.source_history(&sid("home")).await[0].errors.is_empty());
}

#[tokio::test]
async fn test_cancellation_keeps_completed_writes_but_not_token() {
    let mut h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    let shutdown = CancellationToken::new();
    *h.dest.cancel_after_write.lock().unwrap() = Some(("evt-2".to_string(), shutdown.clone()));
    let controller = std::mem::replace(
        &mut h.controller,
        Harness::controller(&h.store, &h.source, &h.dest, &h.credentials),
    );
    let controller = controller.with_shutdown(shutdown);

    let result = controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.sources_synced, 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Cancelled);
    assert!(h.token("work").await.is_none());
    assert_eq!(h.store.dedup_len().await, 2);

    // After a restart the pass resumes without duplicating evt-1 and evt-2
    *h.dest.cancel_after_write.lock().unwrap() = None;
    h.restart();
    let resumed = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(resumed.counters.created, 1);
    assert_eq!(resumed.counters.unchanged, 2);
    assert_eq!(h.dest.written().len(), 3);
    assert!(h.token("work").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_pass_timeout_is_reported_as_cancelled() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    // Never released: only the deadline ends the fetch
    *h.source.gate.lock().unwrap() = Some((entered, release));

    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Cancelled);
    assert!(h.dest.written().is_empty());
}

// ============================================================================
// Directions and configuration errors
// ============================================================================

#[tokio::test]
async fn test_write_only_source_fetches_nothing() {
    let write_only = source("work", "Work").with_direction(SyncDirection::WriteOnly);
    let h = Harness::setup(vec![write_only], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());

    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.sources_synced, 1);
    assert!(result.errors.is_empty());
    assert!(h.source.requests().is_empty());
    assert!(h.dest.written().is_empty());
}

#[tokio::test]
async fn test_missing_destination_is_configuration_error() {
    let h = Harness::with_source_provider(
        vec![source("work", "Work")],
        None,
        MockProvider::new(),
    );
    h.source.set_events(three_events());

    let result = h.controller.run_source(&sid("work")).await.unwrap();

    assert_eq!(result.status, SyncStatus::Failed);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Configuration);
    assert!(h.source.requests().is_empty());
}

#[tokio::test]
async fn test_relayed_source_without_feed_is_configuration_error() {
    let relayed = source("laptop", "Laptop").with_method(SyncMethod::Agent);
    let h = Harness::setup(vec![relayed], ConflictPolicy::SourceWins);

    let result = h.controller.run_source(&sid("laptop")).await.unwrap();

    assert_eq!(result.errors_of(ErrorKind::Configuration).count(), 1);
}

#[tokio::test]
async fn test_run_source_rejects_unknown_and_disabled() {
    let disabled = source("off", "Off").with_enabled(false);
    let h = Harness::setup(vec![disabled], ConflictPolicy::SourceWins);

    let unknown = h.controller.run_source(&sid("ghost")).await;
    assert!(matches!(unknown, Err(ControllerError::NotFound(_))));

    let off = h.controller.run_source(&sid("off")).await;
    assert!(matches!(off, Err(ControllerError::Disabled(_))));

    let all = h.controller.run_all().await.unwrap();
    assert_eq!(all.status, SyncStatus::NoSources);
    assert_eq!(all.skipped[0].reason, SkipReason::Disabled);
}

#[tokio::test]
async fn test_run_all_with_no_sources() {
    let h = Harness::setup(vec![], ConflictPolicy::SourceWins);

    let result = h.controller.run_all().await.unwrap();

    assert_eq!(result.status, SyncStatus::NoSources);
    assert!(result.finished_at.is_some());
}

// ============================================================================
// Configuration surfaces and history
// ============================================================================

#[tokio::test]
async fn test_add_source_rejects_duplicate_id() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);

    let err = h
        .controller
        .add_source(&source("work", "Work again"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ControllerError::Configuration(DomainError::Duplicate { .. })
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_remove_source_drops_state_and_history() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.controller.run_source(&sid("work")).await.unwrap();
    assert_eq!(h.controller.source_history(&sid("work")).await.len(), 1);

    assert!(h.controller.remove_source(&sid("work")).await.unwrap());

    let config = h.controller.get_configuration().await.unwrap();
    assert!(config.sources.is_empty());
    assert_eq!(h.store.dedup_len().await, 0);
    assert!(h.controller.source_history(&sid("work")).await.is_empty());
    assert!(!h.controller.remove_source(&sid("work")).await.unwrap());
}

#[tokio::test]
async fn test_upsert_keeps_tokens() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());
    h.controller.run_source(&sid("work")).await.unwrap();

    h.controller
        .upsert_source(&source("work", "Work (renamed)"))
        .await
        .unwrap();

    assert!(h.token("work").await.is_some());
    let result = h.controller.run_source(&sid("work")).await.unwrap();
    assert_eq!(result.counters.unchanged, 3);
}

#[tokio::test]
async fn test_recent_results_newest_first() {
    let h = Harness::setup(vec![source("work", "Work")], ConflictPolicy::SourceWins);
    h.source.set_events(three_events());

    h.controller.run_source(&sid("work")).await.unwrap();
    h.controller.run_all().await.unwrap();

    let recent = h.controller.recent_results(10).await;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].counters.unchanged, 3);
    assert_eq!(recent[1].counters.created, 3);
}
