//! Synchronization controller
//!
//! [`SyncController`] is the public entry point: it runs passes for one or
//! all sources, exposes the configuration edits, and keeps a bounded history
//! of results.
//!
//! ## Pass lifecycle
//!
//! ```text
//! run_source(id)
//!   ├─ source exists? enabled?            → NotFound / Disabled
//!   ├─ try_acquire(id)                    → Busy
//!   ├─ reload configuration under the lock
//!   ├─ resolve destination, adapters, credentials
//!   └─ SourcePass::run → SyncResult (errors captured, never thrown)
//! ```
//!
//! ## Design Notes
//!
//! - `run_all` starts every enabled source concurrently; a source whose
//!   lock is held is reported in `skipped` and does not fail the run.
//! - A `write_only` source completes immediately with nothing fetched.
//! - Removing a source waits for its in-flight pass before deleting state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use calsync_conflict::PolicyEngine;
use calsync_core::config::{Config, RetryConfig};
use calsync_core::domain::{
    ErrorKind, GlobalSettings, SkipReason, SkippedSource, SourceId, SyncConfiguration,
    SyncDestination, SyncResult, SyncSource,
};
use calsync_core::ports::{ICredentialProvider, IEventFeed, ISyncStateStore, ProviderRegistry};
use calsync_core::usecases::{AuthorizeUseCase, ConfigureUseCase};

use crate::history::ResultHistory;
use crate::locks::SourceLocks;
use crate::pass::{Abort, Fetcher, SourcePass};
use crate::ControllerError;

// ============================================================================
// SyncController
// ============================================================================

/// Runs sync passes and owns the per-source locks
pub struct SyncController {
    store: Arc<dyn ISyncStateStore>,
    providers: ProviderRegistry,
    authorize: AuthorizeUseCase,
    configure: ConfigureUseCase,
    /// Pushed batches for agent-relayed sources
    feed: Option<Arc<dyn IEventFeed>>,
    locks: SourceLocks,
    history: Mutex<ResultHistory>,
    retry: RetryConfig,
    pass_timeout: Duration,
    shutdown: CancellationToken,
}

impl SyncController {
    /// Creates a controller over `store`
    ///
    /// Relayed sources fail with a configuration error until a feed is
    /// attached with [`with_feed`](Self::with_feed).
    pub fn new(
        store: Arc<dyn ISyncStateStore>,
        providers: ProviderRegistry,
        credentials: Arc<dyn ICredentialProvider>,
        config: &Config,
    ) -> Self {
        if providers.is_empty() {
            warn!("No provider adapters registered; API sources cannot sync");
        }

        Self {
            authorize: AuthorizeUseCase::new(credentials, Arc::clone(&store)),
            configure: ConfigureUseCase::new(Arc::clone(&store)),
            store,
            providers,
            feed: None,
            locks: SourceLocks::new(),
            history: Mutex::new(ResultHistory::new()),
            retry: config.retry.clone(),
            pass_timeout: config.sync.pass_timeout(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Attaches the feed that serves agent-relayed sources
    pub fn with_feed(mut self, feed: Arc<dyn IEventFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Uses `shutdown` to interrupt in-flight passes
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ========================================================================
    // Passes
    // ========================================================================

    /// Runs one pass for every enabled source and aggregates the results
    ///
    /// Per-source failures are captured in the result; only failing to read
    /// the configuration is returned as an error.
    #[tracing::instrument(skip(self))]
    pub async fn run_all(&self) -> Result<SyncResult, ControllerError> {
        let mut result = SyncResult::started(Utc::now());
        let config = self
            .configure
            .get_configuration()
            .await
            .map_err(ControllerError::Storage)?;

        let mut ids = Vec::new();
        for source in &config.sources {
            if source.is_enabled() {
                ids.push(source.id().clone());
            } else {
                result.skipped.push(SkippedSource {
                    source_id: source.id().clone(),
                    reason: SkipReason::Disabled,
                });
            }
        }

        info!(sources = ids.len(), "Starting sync of all sources");
        let passes = join_all(ids.iter().map(|id| self.run_pass(id))).await;

        for (id, outcome) in ids.iter().zip(passes) {
            match outcome {
                Ok(pass) => result.absorb(pass),
                Err(ControllerError::Busy(_)) => {
                    debug!(source = %id, "Pass already running, skipped");
                    result.skipped.push(SkippedSource {
                        source_id: id.clone(),
                        reason: SkipReason::Busy,
                    });
                }
                Err(ControllerError::Disabled(_)) => {
                    result.skipped.push(SkippedSource {
                        source_id: id.clone(),
                        reason: SkipReason::Disabled,
                    });
                }
                // Removed while the run was starting
                Err(ControllerError::NotFound(_)) => {}
                Err(err) => result.push_error(id, None, err.kind(), err.to_string()),
            }
        }

        result.finish(Utc::now());
        info!(
            status = ?result.status,
            sources = result.sources_synced,
            events = result.events_synced,
            errors = result.errors.len(),
            skipped = result.skipped.len(),
            "Sync of all sources finished"
        );
        self.history.lock().await.record_run(result.clone());
        Ok(result)
    }

    /// Runs one pass for `id`
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled` and `Busy` when no pass was started. Failures
    /// inside the pass are reported in the returned result.
    #[tracing::instrument(skip(self), fields(source = %id))]
    pub async fn run_source(&self, id: &SourceId) -> Result<SyncResult, ControllerError> {
        let result = self.run_pass(id).await?;
        self.history.lock().await.record_run(result.clone());
        Ok(result)
    }

    async fn run_pass(&self, id: &SourceId) -> Result<SyncResult, ControllerError> {
        let source = self
            .store
            .get_source(id)
            .await?
            .ok_or_else(|| ControllerError::NotFound(id.clone()))?;
        if !source.is_enabled() {
            return Err(ControllerError::Disabled(id.clone()));
        }

        let _guard = self
            .locks
            .try_acquire(id)
            .ok_or_else(|| ControllerError::Busy(id.clone()))?;

        // Tokens may have moved since the first read; take the committed state
        let config = self.store.get_configuration().await?;
        let source = config
            .source(id)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(id.clone()))?;

        let mut result = SyncResult::started(Utc::now());
        debug!(source = %id, direction = ?source.sync_direction(), "Pass started");

        let outcome = match self.prepare(source, &config).await {
            Ok(Some(mut pass)) => pass.run(&mut result).await,
            Ok(None) => {
                debug!(source = %id, "Write-only source, nothing to fetch");
                Ok(())
            }
            Err(abort) => Err(abort),
        };

        match outcome {
            Ok(()) => result.sources_synced = 1,
            Err(abort) => {
                warn!(
                    source = %id,
                    kind = %abort.kind,
                    message = %abort.message,
                    "Pass aborted"
                );
                result.push_error(id, abort.calendar.as_ref(), abort.kind, abort.message);
            }
        }

        result.finish(Utc::now());
        info!(
            source = %id,
            status = ?result.status,
            created = result.counters.created,
            updated = result.counters.updated,
            deleted = result.counters.deleted,
            unchanged = result.counters.unchanged,
            dropped = result.counters.dropped,
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            "Pass finished"
        );
        self.history.lock().await.record_pass(id, result.clone());
        Ok(result)
    }

    /// Resolves everything a pass needs; `None` for a source with nothing to
    /// fetch
    async fn prepare(
        &self,
        source: SyncSource,
        config: &SyncConfiguration,
    ) -> Result<Option<SourcePass<'_>>, Abort> {
        if !source.sync_direction().permits_fetch() {
            return Ok(None);
        }

        let destination = config
            .destination
            .clone()
            .ok_or_else(|| Abort::new(ErrorKind::Configuration, "No destination configured"))?;
        let dest_adapter = self.providers.get(destination.provider_type).ok_or_else(|| {
            Abort::new(
                ErrorKind::Configuration,
                format!(
                    "No adapter registered for destination provider {}",
                    destination.provider_type
                ),
            )
        })?;

        let fetcher = if source.is_relayed() {
            let feed = self.feed.clone().ok_or_else(|| {
                Abort::new(
                    ErrorKind::Configuration,
                    "Source is agent-relayed but no relay feed is attached",
                )
            })?;
            Fetcher::Relay(feed)
        } else {
            let adapter = self.providers.get(source.provider_type()).ok_or_else(|| {
                Abort::new(
                    ErrorKind::Configuration,
                    format!("No adapter registered for provider {}", source.provider_type()),
                )
            })?;
            let credential = self
                .authorize
                .source_credential(&source)
                .await
                .map_err(Abort::from_credential)?;
            Fetcher::Api {
                adapter,
                credential,
            }
        };

        let dest_credential = self
            .authorize
            .destination_credential(&destination)
            .await
            .map_err(Abort::from_credential)?;

        Ok(Some(SourcePass {
            store: self.store.as_ref(),
            authorize: &self.authorize,
            retry: &self.retry,
            policy: PolicyEngine::new(destination.conflict_policy),
            source,
            destination,
            settings: config.global_settings.clone(),
            dest_adapter,
            dest_credential,
            fetcher,
            cancel: self.shutdown.child_token(),
            deadline: Instant::now() + self.pass_timeout,
        }))
    }

    /// Returns true while a pass for `id` is in flight
    pub fn is_busy(&self, id: &SourceId) -> bool {
        self.locks.is_held(id)
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Up to `limit` results of `run_all`/`run_source` calls, newest first
    pub async fn recent_results(&self, limit: usize) -> Vec<SyncResult> {
        self.history.lock().await.recent(limit)
    }

    /// Pass results for one source, newest first
    pub async fn source_history(&self, id: &SourceId) -> Vec<SyncResult> {
        self.history.lock().await.for_source(id)
    }

    // ========================================================================
    // Configuration surfaces
    // ========================================================================

    pub async fn get_configuration(&self) -> Result<SyncConfiguration, ControllerError> {
        self.configure
            .get_configuration()
            .await
            .map_err(ControllerError::Storage)
    }

    /// Adds a source; fails with `Configuration` if the id is taken
    pub async fn add_source(&self, source: &SyncSource) -> Result<(), ControllerError> {
        self.configure
            .add_source(source)
            .await
            .map_err(ControllerError::from_edit)
    }

    /// Inserts or replaces a source, keeping the tokens of calendars it
    /// still lists
    pub async fn upsert_source(&self, source: &SyncSource) -> Result<(), ControllerError> {
        self.configure
            .upsert_source(source)
            .await
            .map_err(ControllerError::from_edit)
    }

    /// Removes a source with its tokens and dedup entries
    ///
    /// Waits for an in-flight pass of the source to finish first. Returns
    /// `false` if the id was unknown.
    #[tracing::instrument(skip(self), fields(source = %id))]
    pub async fn remove_source(&self, id: &SourceId) -> Result<bool, ControllerError> {
        let guard = self.locks.acquire(id).await;
        let removed = self
            .configure
            .remove_source(id)
            .await
            .map_err(ControllerError::from_edit)?;
        self.locks.forget(id);
        drop(guard);

        self.history.lock().await.forget(id);
        Ok(removed)
    }

    pub async fn set_destination(&self, destination: &SyncDestination) -> Result<(), ControllerError> {
        self.configure
            .set_destination(destination)
            .await
            .map_err(ControllerError::from_edit)
    }

    pub async fn update_global_settings(
        &self,
        settings: &GlobalSettings,
    ) -> Result<(), ControllerError> {
        self.configure
            .update_global_settings(settings)
            .await
            .map_err(ControllerError::from_edit)
    }
}
