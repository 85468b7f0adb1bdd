//! Dedup index records
//!
//! The dedup index maps `(destination calendar, dedup key)` to the event the
//! controller produced at the destination. Entries are staged during a page
//! and committed together with the page's sync token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{CalendarId, DestEventId, SourceId, SyncToken};

/// One dedup index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub dest_calendar_id: CalendarId,
    pub dedup_key: String,
    pub dest_event_id: DestEventId,
    pub source_id: SourceId,
    pub source_calendar_id: CalendarId,
    pub provider_event_id: String,
    /// Start of the source event; bounds absence checks to the fetch window
    pub event_start: DateTime<Utc>,
    /// Fingerprint of the source content last written (or adopted)
    pub fingerprint: String,
    /// Source-side `updated_at` of that content
    pub source_updated_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

/// A staged change to the dedup index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupChange {
    Upsert(DedupEntry),
    Remove {
        dest_calendar_id: CalendarId,
        dedup_key: String,
    },
}

/// Everything a completed page persists, applied atomically by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCommit {
    pub source_id: SourceId,
    pub calendar_id: CalendarId,
    pub dedup: Vec<DedupChange>,
    /// New cursor; `None` keeps the stored one (a failed page, or a
    /// provider that returned no cursor)
    pub token: Option<SyncToken>,
    /// Set only for pages that reconciled completely
    pub last_sync: Option<DateTime<Utc>>,
}

impl DedupEntry {
    /// Returns true if the source event starts inside `[start, end)`
    pub fn starts_within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.event_start >= start && self.event_start < end
    }
}

impl BatchCommit {
    /// Returns true if applying the commit would change nothing
    pub fn is_empty(&self) -> bool {
        self.dedup.is_empty() && self.token.is_none() && self.last_sync.is_none()
    }
}
