//! One source pass
//!
//! A [`SourcePass`] is built by the controller once the per-source lock is
//! held and every collaborator has been resolved. It then walks the
//! source's calendars in configuration order:
//!
//! ```text
//! fetch page ──→ reconcile events ──→ (window end) absence removals ──→ commit_batch
//!     ↑                                                                     │
//!     └──────────────────────────── has_more ───────────────────────────────┘
//! ```
//!
//! ## Design Notes
//!
//! - Dedup changes are staged per page and committed in one
//!   [`BatchCommit`]. The token and `last_sync` are only included when every
//!   event of the page reconciled; otherwise the calendar stops and the next
//!   pass refetches from the old token.
//! - Provider calls are raced against the shutdown token and the pass
//!   deadline. An interrupted pass still commits the dedup entries of writes
//!   that completed, so a rerun does not duplicate them, but never the token.
//! - A rejected credential is refreshed once and the call retried once;
//!   a second rejection ends the pass.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use calsync_conflict::{ChangeDetector, Classification, Decision, PolicyEngine};
use calsync_core::config::RetryConfig;
use calsync_core::domain::{
    dedup_key, BatchCommit, CalendarId, ConflictRecord, DedupChange, DedupEntry, DestEventId,
    ErrorKind, EventCounters, EventStatus, GlobalSettings, NormalizedEvent, SyncDestination,
    SyncResult, SyncSource,
};
use calsync_core::ports::{
    Credential, CredentialError, FetchPage, FetchRequest, IEventFeed, IProviderAdapter,
    ISyncStateStore, ProviderError,
};
use calsync_core::usecases::AuthorizeUseCase;

use crate::retry::with_retry;

// ============================================================================
// Failure types
// ============================================================================

/// A failure that ends the whole pass
#[derive(Debug, Clone)]
pub(crate) struct Abort {
    pub kind: ErrorKind,
    pub calendar: Option<CalendarId>,
    pub message: String,
}

impl Abort {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            calendar: None,
            message: message.into(),
        }
    }

    /// Maps a credential failure met while preparing or refreshing
    pub fn from_credential(err: CredentialError) -> Self {
        let kind = match err {
            CredentialError::Missing(_) => ErrorKind::Configuration,
            CredentialError::AuthExpired(_) => ErrorKind::AuthExpired,
            CredentialError::Unavailable(_) => ErrorKind::Transient,
        };
        Self::new(kind, err.to_string())
    }

    fn on(mut self, calendar: &CalendarId) -> Self {
        if self.calendar.is_none() {
            self.calendar = Some(calendar.clone());
        }
        self
    }
}

enum PassError {
    /// The event (or calendar) failed; siblings continue
    Failed { kind: ErrorKind, message: String },
    /// The delta token was rejected by the provider
    InvalidToken(String),
    Abort(Abort),
}

impl From<ProviderError> for PassError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidToken(reason) => PassError::InvalidToken(reason),
            other => PassError::Failed {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

impl From<Abort> for PassError {
    fn from(abort: Abort) -> Self {
        PassError::Abort(abort)
    }
}

fn storage(err: anyhow::Error) -> PassError {
    PassError::Failed {
        kind: ErrorKind::Storage,
        message: format!("{err:#}"),
    }
}

// ============================================================================
// Page bookkeeping
// ============================================================================

#[derive(Default)]
struct PageOutcome {
    changes: Vec<DedupChange>,
    counters: EventCounters,
    conflicts: Vec<ConflictRecord>,
    failures: Vec<(ErrorKind, String)>,
    abort: Option<Abort>,
}

impl PageOutcome {
    fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.abort.is_none()
    }

    /// Records a failed step; returns true when the pass must stop
    fn record(&mut self, err: PassError, provider_event_id: &str) -> bool {
        match err {
            PassError::Failed { kind, message } => {
                self.failures
                    .push((kind, format!("event {provider_event_id}: {message}")));
                false
            }
            PassError::InvalidToken(message) => {
                self.failures.push((ErrorKind::Transient, message));
                false
            }
            PassError::Abort(abort) => {
                self.abort = Some(abort);
                true
            }
        }
    }
}

// ============================================================================
// SourcePass
// ============================================================================

/// Where a source's events come from
pub(crate) enum Fetcher {
    Api {
        adapter: Arc<dyn IProviderAdapter>,
        credential: Credential,
    },
    Relay(Arc<dyn IEventFeed>),
}

/// Everything one pass needs, resolved before any provider I/O
pub(crate) struct SourcePass<'a> {
    pub store: &'a dyn ISyncStateStore,
    pub authorize: &'a AuthorizeUseCase,
    pub retry: &'a RetryConfig,
    pub source: SyncSource,
    pub destination: SyncDestination,
    pub settings: GlobalSettings,
    pub dest_adapter: Arc<dyn IProviderAdapter>,
    pub dest_credential: Credential,
    pub fetcher: Fetcher,
    pub policy: PolicyEngine,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl SourcePass<'_> {
    /// Syncs every calendar of the source into `result`
    ///
    /// Per-calendar failures are recorded and the next calendar runs; an
    /// [`Abort`] stops the pass and is returned for the caller to record.
    pub async fn run(&mut self, result: &mut SyncResult) -> Result<(), Abort> {
        let calendars = self.source.calendars().to_vec();
        for calendar in &calendars {
            self.sync_calendar(calendar, result)
                .await
                .map_err(|abort| abort.on(calendar))?;
        }
        Ok(())
    }

    async fn sync_calendar(
        &mut self,
        calendar: &CalendarId,
        result: &mut SyncResult,
    ) -> Result<(), Abort> {
        let source_id = self.source.id().clone();
        let target = self.destination.target_calendar(&source_id).clone();
        let (window_start, window_end) = self.settings.fetch_window(Utc::now());
        let window = FetchRequest::Window {
            start: window_start,
            end: window_end,
        };

        let mut request = match self.source.token(calendar) {
            Some(token) => FetchRequest::Delta(token.clone()),
            None => window.clone(),
        };
        // Relayed batches are incremental even without a token
        let mut snapshot = request.is_window() && !self.source.is_relayed();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pages = 0u32;

        debug!(
            source = %source_id,
            calendar = %calendar,
            delta = !request.is_window(),
            "Syncing calendar"
        );

        loop {
            let page = match self.fetch(calendar, &request).await {
                Ok(page) => page,
                Err(PassError::InvalidToken(reason)) if !request.is_window() => {
                    warn!(
                        source = %source_id,
                        calendar = %calendar,
                        %reason,
                        "Sync token rejected, falling back to a full fetch"
                    );
                    if let Err(e) = self.store.clear_token(&source_id, calendar).await {
                        result.push_error(
                            &source_id,
                            Some(calendar),
                            ErrorKind::Storage,
                            format!("{e:#}"),
                        );
                        return Ok(());
                    }
                    self.source.clear_token(calendar);
                    request = window.clone();
                    snapshot = !self.source.is_relayed();
                    seen.clear();
                    continue;
                }
                Err(PassError::InvalidToken(reason)) => {
                    result.push_error(&source_id, Some(calendar), ErrorKind::Transient, reason);
                    return Ok(());
                }
                Err(PassError::Failed { kind, message }) => {
                    warn!(source = %source_id, calendar = %calendar, %kind, %message, "Fetch failed");
                    result.push_error(&source_id, Some(calendar), kind, message);
                    return Ok(());
                }
                Err(PassError::Abort(abort)) => return Err(abort),
            };
            pages += 1;

            if page.has_more && page.next_token.is_none() {
                warn!(
                    source = %source_id,
                    calendar = %calendar,
                    "Provider reported more pages without a cursor, stopping here"
                );
            }
            let last_page = !page.has_more || page.next_token.is_none();

            let mut outcome = self.reconcile_page(calendar, &target, &page, &mut seen).await;

            if snapshot && last_page && outcome.is_clean() {
                self.remove_absent(calendar, &target, &seen, window_start, window_end, &mut outcome)
                    .await;
            }

            let clean = outcome.is_clean();
            let committed_at = Utc::now();
            let commit = BatchCommit {
                source_id: source_id.clone(),
                calendar_id: calendar.clone(),
                dedup: std::mem::take(&mut outcome.changes),
                token: if clean { page.next_token.clone() } else { None },
                last_sync: clean.then_some(committed_at),
            };

            if let Err(e) = self.store.commit_batch(&commit).await {
                error!(
                    source = %source_id,
                    calendar = %calendar,
                    error = %e,
                    "Failed to commit page"
                );
                result.push_error(
                    &source_id,
                    Some(calendar),
                    ErrorKind::Storage,
                    format!("commit failed: {e:#}"),
                );
                return Ok(());
            }
            if clean {
                self.source
                    .record_commit(calendar, commit.token.clone(), committed_at);
            }

            result.counters.absorb(&outcome.counters);
            result.conflicts.append(&mut outcome.conflicts);
            for (kind, message) in outcome.failures.drain(..) {
                result.push_error(&source_id, Some(calendar), kind, message);
            }

            if let Some(abort) = outcome.abort {
                return Err(abort);
            }
            if !clean {
                warn!(
                    source = %source_id,
                    calendar = %calendar,
                    "Page had failures, token not advanced"
                );
                return Ok(());
            }
            match (last_page, page.next_token) {
                (false, Some(next)) => request = FetchRequest::Delta(next),
                _ => break,
            }
        }

        debug!(source = %source_id, calendar = %calendar, pages, "Calendar synced");
        Ok(())
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    async fn reconcile_page(
        &mut self,
        calendar: &CalendarId,
        target: &CalendarId,
        page: &FetchPage,
        seen: &mut HashSet<String>,
    ) -> PageOutcome {
        let mut outcome = PageOutcome::default();
        let provider = self.source.provider_type();

        for event in &page.events {
            let key = dedup_key(self.source.id(), calendar, provider, &event.provider_event_id);
            seen.insert(key.clone());

            let step = if event.status == EventStatus::Cancelled {
                self.remove_key(target, &key, &mut outcome).await
            } else {
                self.reconcile_event(calendar, target, &key, event, &mut outcome)
                    .await
            };
            if let Err(err) = step {
                if outcome.record(err, &event.provider_event_id) {
                    return outcome;
                }
            }
        }

        for removed in &page.removed {
            let key = dedup_key(self.source.id(), calendar, provider, removed);
            if let Err(err) = self.remove_key(target, &key, &mut outcome).await {
                if outcome.record(err, removed) {
                    return outcome;
                }
            }
        }

        outcome
    }

    async fn reconcile_event(
        &mut self,
        calendar: &CalendarId,
        target: &CalendarId,
        key: &str,
        event: &NormalizedEvent,
        outcome: &mut PageOutcome,
    ) -> Result<(), PassError> {
        if let Err(e) = event.validate() {
            warn!(source = %self.source.id(), error = %e, "Skipping invalid event");
            outcome.counters.dropped += 1;
            return Ok(());
        }

        let fingerprint = event.fingerprint();
        let existing = self
            .store
            .dedup_lookup(target, key)
            .await
            .map_err(storage)?;

        match ChangeDetector::classify(existing.as_ref(), &fingerprint) {
            Classification::New => {
                let dest_event_id = self.create(target, event).await?;
                outcome.changes.push(DedupChange::Upsert(self.entry(
                    calendar,
                    target,
                    key,
                    dest_event_id,
                    event,
                    fingerprint,
                )));
                outcome.counters.created += 1;
            }
            Classification::Unchanged(_) => {
                outcome.counters.unchanged += 1;
            }
            Classification::Changed(entry) => {
                let entry = entry.clone();
                self.resolve_change(calendar, target, key, event, fingerprint, &entry, outcome)
                    .await?;
            }
        }
        Ok(())
    }

    /// Applies the conflict policy to an event whose content changed
    #[allow(clippy::too_many_arguments)]
    async fn resolve_change(
        &mut self,
        calendar: &CalendarId,
        target: &CalendarId,
        key: &str,
        event: &NormalizedEvent,
        fingerprint: String,
        entry: &DedupEntry,
        outcome: &mut PageOutcome,
    ) -> Result<(), PassError> {
        let destination_updated_at = if self.policy.needs_destination_version() {
            let dest_event_id = &entry.dest_event_id;
            let current = self
                .dest_call("get_event", |adapter, credential| async move {
                    adapter.get_event(&credential, target, dest_event_id).await
                })
                .await?;
            match current {
                Some(current) => Some(current.updated_at),
                None => {
                    debug!(key, "Destination copy is gone, recreating");
                    let dest_event_id = self.create(target, event).await?;
                    outcome.changes.push(DedupChange::Upsert(self.entry(
                        calendar,
                        target,
                        key,
                        dest_event_id,
                        event,
                        fingerprint,
                    )));
                    outcome.counters.created += 1;
                    return Ok(());
                }
            }
        } else {
            None
        };

        let decision = self
            .policy
            .decide(event.updated_at, destination_updated_at)
            .map_err(|e| PassError::Failed {
                kind: ErrorKind::Conflict,
                message: e.to_string(),
            })?;

        match decision {
            Decision::Overwrite => {
                let (dest_event_id, recreated) =
                    self.overwrite(target, &entry.dest_event_id, event).await?;
                outcome.changes.push(DedupChange::Upsert(self.entry(
                    calendar,
                    target,
                    key,
                    dest_event_id,
                    event,
                    fingerprint,
                )));
                if recreated {
                    outcome.counters.created += 1;
                } else {
                    outcome.counters.updated += 1;
                }
            }
            Decision::KeepDestination => {
                // Adopt the incoming fingerprint so the same change is not
                // re-evaluated on every pass
                outcome.changes.push(DedupChange::Upsert(self.entry(
                    calendar,
                    target,
                    key,
                    entry.dest_event_id.clone(),
                    event,
                    fingerprint,
                )));
                outcome.counters.dropped += 1;
            }
            Decision::Flag => {
                info!(
                    source = %self.source.id(),
                    key,
                    dest_event_id = %entry.dest_event_id,
                    "Conflict recorded for manual resolution"
                );
                outcome.conflicts.push(ConflictRecord {
                    source_id: self.source.id().clone(),
                    source_calendar_id: calendar.clone(),
                    provider_event_id: event.provider_event_id.clone(),
                    dest_calendar_id: target.clone(),
                    dest_event_id: entry.dest_event_id.clone(),
                    incoming_updated_at: event.updated_at,
                    detected_at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    /// Deletes the destination copy recorded under `key`, if deletions are
    /// permitted for the source
    async fn remove_key(
        &mut self,
        target: &CalendarId,
        key: &str,
        outcome: &mut PageOutcome,
    ) -> Result<(), PassError> {
        let Some(entry) = self
            .store
            .dedup_lookup(target, key)
            .await
            .map_err(storage)?
        else {
            return Ok(());
        };
        self.remove_entry(&entry, outcome).await
    }

    async fn remove_entry(
        &mut self,
        entry: &DedupEntry,
        outcome: &mut PageOutcome,
    ) -> Result<(), PassError> {
        if !self.source.sync_direction().permits_deletions() {
            debug!(
                source = %self.source.id(),
                key = %entry.dedup_key,
                direction = ?self.source.sync_direction(),
                "Removal not propagated for this sync direction"
            );
            outcome.counters.dropped += 1;
            return Ok(());
        }

        let target = &entry.dest_calendar_id;
        let dest_event_id = &entry.dest_event_id;
        let deleted = self
            .dest_call("delete_event", |adapter, credential| async move {
                adapter.delete_event(&credential, target, dest_event_id).await
            })
            .await;
        match deleted {
            Ok(()) | Err(PassError::Failed {
                kind: ErrorKind::NotFound,
                ..
            }) => {}
            Err(err) => return Err(err),
        }

        outcome.changes.push(DedupChange::Remove {
            dest_calendar_id: entry.dest_calendar_id.clone(),
            dedup_key: entry.dedup_key.clone(),
        });
        outcome.counters.deleted += 1;
        Ok(())
    }

    /// Removes destination copies of events that a complete window fetch
    /// no longer returned
    async fn remove_absent(
        &mut self,
        calendar: &CalendarId,
        target: &CalendarId,
        seen: &HashSet<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        outcome: &mut PageOutcome,
    ) {
        let entries = match self
            .store
            .dedup_entries_for(target, self.source.id(), calendar)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                outcome.failures.push((ErrorKind::Storage, format!("{e:#}")));
                return;
            }
        };

        let absent: Vec<DedupEntry> = entries
            .into_iter()
            .filter(|e| !seen.contains(&e.dedup_key) && e.starts_within(window_start, window_end))
            .collect();
        if !absent.is_empty() {
            debug!(
                source = %self.source.id(),
                calendar = %calendar,
                count = absent.len(),
                "Events missing from full fetch"
            );
        }

        for entry in &absent {
            if let Err(err) = self.remove_entry(entry, outcome).await {
                if outcome.record(err, &entry.provider_event_id) {
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Destination writes
    // ========================================================================

    async fn create(
        &mut self,
        target: &CalendarId,
        event: &NormalizedEvent,
    ) -> Result<DestEventId, PassError> {
        let decorated = self.decorate(event);
        let decorated = &decorated;
        self.dest_call("write_event", |adapter, credential| async move {
            adapter.write_event(&credential, target, decorated).await
        })
        .await
    }

    /// Updates the destination copy, recreating it if it no longer exists;
    /// the flag reports a recreation
    async fn overwrite(
        &mut self,
        target: &CalendarId,
        dest_event_id: &DestEventId,
        event: &NormalizedEvent,
    ) -> Result<(DestEventId, bool), PassError> {
        let decorated = self.decorate(event);
        let decorated = &decorated;
        let updated = self
            .dest_call("update_event", |adapter, credential| async move {
                adapter
                    .update_event(&credential, target, dest_event_id, decorated)
                    .await
            })
            .await;

        match updated {
            Ok(id) => Ok((id, false)),
            Err(PassError::Failed {
                kind: ErrorKind::NotFound,
                ..
            }) => {
                debug!(dest_event_id = %dest_event_id, "Destination copy is gone, recreating");
                let id = self.create(target, event).await?;
                Ok((id, true))
            }
            Err(err) => Err(err),
        }
    }

    /// Copy of `event` as written to the destination
    fn decorate(&self, event: &NormalizedEvent) -> NormalizedEvent {
        let mut decorated = event.clone();

        if self.settings.annotate_origin {
            let origin = format!("Synced from: {}", self.source.name());
            decorated.description = Some(match decorated.description.take() {
                Some(text) if !text.trim().is_empty() => format!("{text}\n\n{origin}"),
                _ => origin,
            });
        }

        let category = self.destination.category_for(&self.source);
        if !decorated.categories.contains(&category) {
            decorated.categories.push(category);
        }
        decorated.color = Some(self.destination.color_for(&self.source));
        decorated.last_synced = Some(Utc::now());
        decorated
    }

    fn entry(
        &self,
        calendar: &CalendarId,
        target: &CalendarId,
        key: &str,
        dest_event_id: DestEventId,
        event: &NormalizedEvent,
        fingerprint: String,
    ) -> DedupEntry {
        DedupEntry {
            dest_calendar_id: target.clone(),
            dedup_key: key.to_string(),
            dest_event_id,
            source_id: self.source.id().clone(),
            source_calendar_id: calendar.clone(),
            provider_event_id: event.provider_event_id.clone(),
            event_start: event.start,
            fingerprint,
            source_updated_at: event.updated_at,
            synced_at: Utc::now(),
        }
    }

    // ========================================================================
    // Provider calls
    // ========================================================================

    /// Races a provider call against shutdown and the pass deadline
    async fn guarded<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, PassError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(PassError::Abort(Abort::new(ErrorKind::Cancelled, "pass cancelled by shutdown")))
            }
            _ = tokio::time::sleep_until(self.deadline) => {
                Err(PassError::Abort(Abort::new(ErrorKind::Cancelled, "pass timed out")))
            }
            outcome = call => outcome.map_err(PassError::from),
        }
    }

    async fn fetch(
        &mut self,
        calendar: &CalendarId,
        request: &FetchRequest,
    ) -> Result<FetchPage, PassError> {
        let (adapter, credential) = match &self.fetcher {
            Fetcher::Relay(feed) => {
                let token = match request {
                    FetchRequest::Delta(token) => Some(token),
                    FetchRequest::Window { .. } => None,
                };
                let source_id = self.source.id();
                return self
                    .guarded(with_retry("fetch_batch", self.retry, || {
                        feed.fetch_batch(source_id, calendar, token)
                    }))
                    .await;
            }
            Fetcher::Api {
                adapter,
                credential,
            } => (Arc::clone(adapter), credential.clone()),
        };

        let first = self
            .guarded(with_retry("fetch_events", self.retry, || {
                adapter.fetch_events(&credential, calendar, request)
            }))
            .await;
        let reason = match first {
            Err(PassError::Failed {
                kind: ErrorKind::AuthExpired,
                message,
            }) => message,
            other => return other,
        };

        debug!(source = %self.source.id(), %reason, "Source credential rejected, refreshing");
        let refreshed = self
            .authorize
            .refresh_rejected(&self.source, &credential)
            .await
            .map_err(Abort::from_credential)?;
        if let Fetcher::Api { credential, .. } = &mut self.fetcher {
            *credential = refreshed.clone();
        }

        let retried = self
            .guarded(with_retry("fetch_events", self.retry, || {
                adapter.fetch_events(&refreshed, calendar, request)
            }))
            .await;
        match retried {
            Err(PassError::Failed {
                kind: ErrorKind::AuthExpired,
                message,
            }) => {
                self.authorize.mark_needs_reauth(&self.source).await;
                Err(Abort::new(
                    ErrorKind::AuthExpired,
                    format!("refreshed credential rejected: {message}"),
                )
                .into())
            }
            other => other,
        }
    }

    /// Calls the destination adapter, refreshing its credential once on
    /// `AuthExpired`
    async fn dest_call<T, F, Fut>(&mut self, operation: &str, call: F) -> Result<T, PassError>
    where
        F: Fn(Arc<dyn IProviderAdapter>, Credential) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let adapter = Arc::clone(&self.dest_adapter);

        let first = self
            .guarded(with_retry(operation, self.retry, || {
                call(Arc::clone(&adapter), self.dest_credential.clone())
            }))
            .await;
        let reason = match first {
            Err(PassError::Failed {
                kind: ErrorKind::AuthExpired,
                message,
            }) => message,
            other => return other,
        };

        debug!(destination = %self.destination.id, %reason, "Destination credential rejected, refreshing");
        self.dest_credential = self
            .authorize
            .refresh_destination(&self.dest_credential)
            .await
            .map_err(Abort::from_credential)?;

        let retried = self
            .guarded(with_retry(operation, self.retry, || {
                call(Arc::clone(&adapter), self.dest_credential.clone())
            }))
            .await;
        match retried {
            Err(PassError::Failed {
                kind: ErrorKind::AuthExpired,
                message,
            }) => Err(Abort::new(
                ErrorKind::AuthExpired,
                format!("destination rejected refreshed credential: {message}"),
            )
            .into()),
            other => other,
        }
    }
}
