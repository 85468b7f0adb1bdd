//! Pass results
//!
//! A [`SyncResult`] is produced by every controller pass and by `RunAll`.
//! It is a report, not state: nothing in it is read back by later passes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{CalendarId, DestEventId, SourceId};

/// Error taxonomy shared by the controller and its callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown source or destination reference; caller error
    NotFound,
    /// Source intentionally inactive
    Disabled,
    /// A pass for the same source is in flight
    Busy,
    /// Credential needs re-authorization
    AuthExpired,
    RateLimited,
    Transient,
    /// Recorded under the manual conflict policy
    Conflict,
    /// Missing destination, adapter or credential provider
    Configuration,
    /// Pass cancelled or timed out
    Cancelled,
    /// State store failure
    Storage,
}

impl ErrorKind {
    /// Returns true if the next scheduled pass may succeed without operator
    /// intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Busy
                | ErrorKind::RateLimited
                | ErrorKind::Transient
                | ErrorKind::Cancelled
                | ErrorKind::Storage
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Disabled => "disabled",
            ErrorKind::Busy => "busy",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal error captured during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceError {
    pub source_id: SourceId,
    /// `None` for source-level failures (credentials, configuration)
    pub calendar_id: Option<CalendarId>,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.calendar_id {
            Some(calendar) => write!(
                f,
                "[{}] {}/{}: {}",
                self.kind, self.source_id, calendar, self.message
            ),
            None => write!(f, "[{}] {}: {}", self.kind, self.source_id, self.message),
        }
    }
}

/// A changed event left untouched under the manual policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub source_id: SourceId,
    pub source_calendar_id: CalendarId,
    pub provider_event_id: String,
    pub dest_calendar_id: CalendarId,
    pub dest_event_id: DestEventId,
    pub incoming_updated_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

/// Why a source was not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Busy,
    Disabled,
}

/// A source left out of a `RunAll`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSource {
    pub source_id: SourceId,
    pub reason: SkipReason,
}

/// Per-outcome event counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounters {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    /// Present with an unchanged fingerprint
    pub unchanged: u32,
    /// Incoming change or removal discarded by policy or direction
    pub dropped: u32,
}

impl EventCounters {
    pub fn absorb(&mut self, other: &EventCounters) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.dropped += other.dropped;
    }
}

/// Overall outcome of a pass or a `RunAll`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No errors
    Success,
    /// Some sources synced, some errors
    Partial,
    /// Errors and nothing synced
    Failed,
    /// Nothing was eligible to run
    #[default]
    NoSources,
}

/// Report of one pass, or of several aggregated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub status: SyncStatus,
    pub sources_synced: u32,
    pub events_synced: u32,
    pub counters: EventCounters,
    pub errors: Vec<SourceError>,
    pub conflicts: Vec<ConflictRecord>,
    pub skipped: Vec<SkippedSource>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncResult {
    /// Empty result starting at `started_at`
    pub fn started(started_at: DateTime<Utc>) -> Self {
        Self {
            status: SyncStatus::NoSources,
            sources_synced: 0,
            events_synced: 0,
            counters: EventCounters::default(),
            errors: Vec::new(),
            conflicts: Vec::new(),
            skipped: Vec::new(),
            started_at,
            finished_at: None,
        }
    }

    /// Records a captured error
    pub fn push_error(
        &mut self,
        source_id: &SourceId,
        calendar_id: Option<&CalendarId>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(SourceError {
            source_id: source_id.clone(),
            calendar_id: calendar_id.cloned(),
            kind,
            message: message.into(),
        });
    }

    /// Folds a per-source result into an aggregate
    pub fn absorb(&mut self, other: SyncResult) {
        self.sources_synced += other.sources_synced;
        self.counters.absorb(&other.counters);
        self.errors.extend(other.errors);
        self.conflicts.extend(other.conflicts);
        self.skipped.extend(other.skipped);
        self.events_synced = self.counters.created + self.counters.updated + self.counters.deleted;
    }

    /// Stamps the end time and derives `status` and `events_synced`
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.events_synced = self.counters.created + self.counters.updated + self.counters.deleted;
        self.status = match (self.errors.is_empty(), self.sources_synced) {
            (true, 0) if self.counters == EventCounters::default() => SyncStatus::NoSources,
            (true, _) => SyncStatus::Success,
            (false, 0) => SyncStatus::Failed,
            (false, _) => SyncStatus::Partial,
        };
        self.finished_at = Some(finished_at);
    }

    /// Errors of one kind
    pub fn errors_of(&self, kind: ErrorKind) -> impl Iterator<Item = &SourceError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }
}
