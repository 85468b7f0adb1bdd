//! Change detection against the dedup index
//!
//! Classifies an incoming event by comparing its fingerprint with the one
//! recorded when the destination copy was last written.

use calsync_core::domain::DedupEntry;
use tracing::trace;

/// How an incoming event relates to what the destination already holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<'a> {
    /// No dedup entry: the event was never written
    New,
    /// Same fingerprint as the recorded copy
    Unchanged(&'a DedupEntry),
    /// Fingerprint differs; the conflict policy decides
    Changed(&'a DedupEntry),
}

/// Stateless change detector
pub struct ChangeDetector;

impl ChangeDetector {
    /// Classifies an incoming fingerprint against the recorded entry
    pub fn classify<'a>(existing: Option<&'a DedupEntry>, incoming_fingerprint: &str) -> Classification<'a> {
        match existing {
            None => Classification::New,
            Some(entry) if entry.fingerprint == incoming_fingerprint => {
                trace!(key = %entry.dedup_key, "Fingerprint unchanged");
                Classification::Unchanged(entry)
            }
            Some(entry) => {
                trace!(
                    key = %entry.dedup_key,
                    recorded = %entry.fingerprint,
                    incoming = %incoming_fingerprint,
                    "Fingerprint changed"
                );
                Classification::Changed(entry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::domain::{CalendarId, DestEventId, SourceId};
    use chrono::Utc;

    fn entry(fingerprint: &str) -> DedupEntry {
        DedupEntry {
            dest_calendar_id: CalendarId::new("dest".to_string()).unwrap(),
            dedup_key: "work/primary/google:1".to_string(),
            dest_event_id: DestEventId::new("d-1".to_string()).unwrap(),
            source_id: SourceId::new("work".to_string()).unwrap(),
            source_calendar_id: CalendarId::new("primary".to_string()).unwrap(),
            provider_event_id: "1".to_string(),
            event_start: Utc::now(),
            fingerprint: fingerprint.to_string(),
            source_updated_at: Utc::now(),
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_when_absent() {
        assert_eq!(ChangeDetector::classify(None, "abc"), Classification::New);
    }

    #[test]
    fn test_unchanged_and_changed() {
        let recorded = entry("abc");
        assert!(matches!(
            ChangeDetector::classify(Some(&recorded), "abc"),
            Classification::Unchanged(_)
        ));
        assert!(matches!(
            ChangeDetector::classify(Some(&recorded), "def"),
            Classification::Changed(_)
        ));
    }
}
