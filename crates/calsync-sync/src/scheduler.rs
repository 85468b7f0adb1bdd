//! Sync scheduler - turns source frequencies into controller passes
//!
//! The [`SyncScheduler`] keeps a next-due instant per enabled source and, on
//! every tick, runs the sources that are due through the
//! [`SyncController`]. On-demand requests arrive through a channel and run
//! immediately.
//!
//! ## Flow
//!
//! ```text
//! interval.tick() ──→ due sources ──┐
//!                                   ├──→ JoinSet<run_source> ──→ settle
//! SchedulerHandle ──→ mpsc::Receiver┘
//! ```
//!
//! ## Design Notes
//!
//! - A source that has never synced is due immediately; otherwise it is due
//!   `interval` after its persisted `last_sync`.
//! - `manual` sources never become due; they only run when triggered.
//! - The run loop spawns every pass into a `JoinSet` and settles due times
//!   as passes finish, so a slow source never delays ticks or triggers for
//!   other sources. A source with a scheduled pass in flight is not spawned
//!   again.
//! - A `Busy` source keeps its due time and is tried again on the next
//!   tick. Missed ticks are not queued.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use calsync_core::config::Config;
use calsync_core::domain::{
    AgentStatus, FrequencyIntervals, SourceId, SyncConfiguration, SyncResult,
};

use crate::controller::SyncController;
use crate::ControllerError;

/// Buffered on-demand requests
const TRIGGER_BUFFER: usize = 32;

// ============================================================================
// SchedulerHandle
// ============================================================================

/// Cloneable sender for on-demand sync requests
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SourceId>,
}

impl SchedulerHandle {
    /// Asks the running scheduler to sync `source_id` now
    ///
    /// Returns `false` if the scheduler has stopped.
    pub async fn trigger(&self, source_id: SourceId) -> bool {
        self.tx.send(source_id).await.is_ok()
    }
}

// ============================================================================
// SyncScheduler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOrigin {
    Scheduled,
    OnDemand,
}

/// A pass spawned by the run loop, back from its task
struct FinishedPass {
    source_id: SourceId,
    origin: PassOrigin,
    started: DateTime<Utc>,
    outcome: Result<SyncResult, ControllerError>,
}

/// Runs controller passes on each source's frequency
pub struct SyncScheduler {
    controller: Arc<SyncController>,
    tick_interval: Duration,
    intervals: FrequencyIntervals,
    next_due: HashMap<SourceId, DateTime<Utc>>,
    /// Sources with a scheduled pass running in the run loop
    in_flight: HashSet<SourceId>,
    trigger_tx: mpsc::Sender<SourceId>,
    trigger_rx: mpsc::Receiver<SourceId>,
    /// Log stale agents on every tick
    health_probe: bool,
}

impl SyncScheduler {
    pub fn new(controller: Arc<SyncController>, config: &Config) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_BUFFER);

        let intervals = config.scheduler.frequency_intervals();
        info!(
            tick_secs = config.scheduler.tick_interval().as_secs(),
            real_time_secs = intervals.real_time.as_secs(),
            hourly_secs = intervals.hourly.as_secs(),
            daily_secs = intervals.daily.as_secs(),
            "Creating sync scheduler"
        );

        Self {
            controller,
            tick_interval: config.scheduler.tick_interval(),
            intervals,
            next_due: HashMap::new(),
            in_flight: HashSet::new(),
            trigger_tx,
            trigger_rx,
            health_probe: false,
        }
    }

    /// Logs stale remote agents on every tick
    pub fn with_health_probe(mut self) -> Self {
        self.health_probe = true;
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.trigger_tx.clone(),
        }
    }

    /// When `source_id` is next due, if it is scheduled at all
    pub fn next_due(&self, source_id: &SourceId) -> Option<DateTime<Utc>> {
        self.next_due.get(source_id).copied()
    }

    // ========================================================================
    // Ticks
    // ========================================================================

    /// Runs every source that is due at `now` and waits for the passes
    ///
    /// Returns the ids of sources whose pass ran (successfully or with
    /// captured errors).
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<SourceId>, ControllerError> {
        let (config, due) = self.due_at(now).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }

        debug!(count = due.len(), "Sources due");
        let controller = Arc::clone(&self.controller);
        let outcomes = join_all(due.iter().map(|id| controller.run_source(id))).await;

        let mut ran = Vec::new();
        for (id, outcome) in due.into_iter().zip(outcomes) {
            if self.settle(&id, &outcome, now, &config) {
                ran.push(id);
            }
        }
        Ok(ran)
    }

    /// Runs `source_id` now, regardless of its frequency
    pub async fn trigger(&mut self, source_id: &SourceId) -> Result<SyncResult, ControllerError> {
        info!(source = %source_id, "On-demand sync requested");
        let outcome = self.controller.run_source(source_id).await;
        let config = self.controller.get_configuration().await?;
        self.settle(source_id, &outcome, Utc::now(), &config);
        outcome
    }

    /// Refreshes the schedule and returns the sources due at `now` that have
    /// no scheduled pass in flight
    async fn due_at(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<(SyncConfiguration, Vec<SourceId>), ControllerError> {
        let config = self.controller.get_configuration().await?;
        self.refresh_schedule(&config);

        let due = self
            .next_due
            .iter()
            .filter(|(id, at)| **at <= now && !self.in_flight.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();

        if self.health_probe {
            log_agent_health(&config, now);
        }
        Ok((config, due))
    }

    /// Adds newly enabled sources and drops removed, disabled or manual ones
    fn refresh_schedule(&mut self, config: &SyncConfiguration) {
        let default = config.global_settings.default_frequency;
        let intervals = self.intervals;

        self.next_due.retain(|id, _| {
            config.source(id).is_some_and(|source| {
                source.is_enabled()
                    && source
                        .effective_frequency(default)
                        .interval(&intervals)
                        .is_some()
            })
        });

        for source in config.enabled_sources() {
            let Some(interval) = source.effective_frequency(default).interval(&intervals) else {
                continue;
            };
            if self.next_due.contains_key(source.id()) {
                continue;
            }
            let due = match source.last_sync() {
                Some(last) => after(last, interval),
                None => DateTime::<Utc>::MIN_UTC,
            };
            debug!(source = %source.id(), due = %due, "Source scheduled");
            self.next_due.insert(source.id().clone(), due);
        }
    }

    /// Updates the due time after a pass attempt; true if a pass ran
    fn settle(
        &mut self,
        id: &SourceId,
        outcome: &Result<SyncResult, ControllerError>,
        now: DateTime<Utc>,
        config: &SyncConfiguration,
    ) -> bool {
        let interval = config.source(id).and_then(|source| {
            source
                .effective_frequency(config.global_settings.default_frequency)
                .interval(&self.intervals)
        });

        match outcome {
            Ok(result) => {
                if let Some(interval) = interval {
                    self.next_due.insert(id.clone(), after(now, interval));
                }
                debug!(source = %id, status = ?result.status, "Scheduled pass done");
                true
            }
            Err(ControllerError::Busy(_)) => {
                debug!(source = %id, "Source busy, retrying next tick");
                false
            }
            Err(ControllerError::NotFound(_)) | Err(ControllerError::Disabled(_)) => {
                self.next_due.remove(id);
                false
            }
            Err(err) => {
                warn!(source = %id, error = %err, "Scheduled pass failed to start");
                if let Some(interval) = interval {
                    self.next_due.insert(id.clone(), after(now, interval));
                }
                false
            }
        }
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Main loop: ticks on the configured interval and serves on-demand
    /// requests until `shutdown` is cancelled
    ///
    /// Passes run as tasks; the loop keeps ticking and accepting triggers
    /// while they are in flight. On shutdown it waits for running passes,
    /// which stop at their next cancellation point.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Sync scheduler starting");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut passes = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, scheduler stopping");
                    break;
                }

                Some(joined) = passes.join_next() => match joined {
                    Ok(finished) => self.finish(finished).await,
                    Err(err) => warn!(error = %err, "Sync pass task failed"),
                },

                Some(source_id) = self.trigger_rx.recv() => {
                    info!(source = %source_id, "On-demand sync requested");
                    self.spawn_pass(&mut passes, source_id, PassOrigin::OnDemand, Utc::now());
                }

                _ = ticker.tick() => {
                    let now = Utc::now();
                    match self.due_at(now).await {
                        Ok((_, due)) => {
                            if !due.is_empty() {
                                debug!(count = due.len(), "Sources due");
                            }
                            for source_id in due {
                                self.spawn_pass(&mut passes, source_id, PassOrigin::Scheduled, now);
                            }
                        }
                        Err(err) => warn!(error = %err, "Scheduler tick failed"),
                    }
                }
            }
        }

        if !passes.is_empty() {
            info!(count = passes.len(), "Waiting for running passes");
            while passes.join_next().await.is_some() {}
        }
        info!("Sync scheduler stopped");
    }

    fn spawn_pass(
        &mut self,
        passes: &mut JoinSet<FinishedPass>,
        source_id: SourceId,
        origin: PassOrigin,
        started: DateTime<Utc>,
    ) {
        if origin == PassOrigin::Scheduled {
            self.in_flight.insert(source_id.clone());
        }
        let controller = Arc::clone(&self.controller);
        passes.spawn(async move {
            let outcome = controller.run_source(&source_id).await;
            FinishedPass {
                source_id,
                origin,
                started,
                outcome,
            }
        });
    }

    async fn finish(&mut self, pass: FinishedPass) {
        if pass.origin == PassOrigin::Scheduled {
            self.in_flight.remove(&pass.source_id);
        }

        match self.controller.get_configuration().await {
            Ok(config) => {
                self.settle(&pass.source_id, &pass.outcome, pass.started, &config);
            }
            Err(err) => warn!(source = %pass.source_id, error = %err, "Cannot reschedule source"),
        }

        if pass.origin == PassOrigin::OnDemand {
            match &pass.outcome {
                Ok(result) => info!(
                    source = %pass.source_id,
                    status = ?result.status,
                    events = result.events_synced,
                    "On-demand sync finished"
                ),
                Err(err) => {
                    warn!(source = %pass.source_id, error = %err, "On-demand sync not run")
                }
            }
        }
    }
}

fn after(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn log_agent_health(config: &SyncConfiguration, now: DateTime<Utc>) {
    for agent in &config.agents {
        if agent.status_at(now) == AgentStatus::Stale {
            warn!(
                agent = %agent.id,
                name = %agent.name,
                source = %agent.source_id,
                last_check_in = ?agent.last_check_in,
                "Remote agent is stale"
            );
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
