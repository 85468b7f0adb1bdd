//! Bounded in-memory history of pass results

use std::collections::{HashMap, VecDeque};

use calsync_core::domain::{SourceId, SyncResult};

/// Results kept for `recent`
pub const RECENT_CAPACITY: usize = 100;
/// Results kept per source
pub const PER_SOURCE_CAPACITY: usize = 50;

/// Recent run results plus a per-source pass log
#[derive(Debug, Default)]
pub struct ResultHistory {
    recent: VecDeque<SyncResult>,
    per_source: HashMap<SourceId, VecDeque<SyncResult>>,
}

fn push_bounded(queue: &mut VecDeque<SyncResult>, result: SyncResult, capacity: usize) {
    if queue.len() == capacity {
        queue.pop_front();
    }
    queue.push_back(result);
}

impl ResultHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of one controller call (`run_all` or `run_source`)
    pub fn record_run(&mut self, result: SyncResult) {
        push_bounded(&mut self.recent, result, RECENT_CAPACITY);
    }

    /// Records one source's pass
    pub fn record_pass(&mut self, source_id: &SourceId, result: SyncResult) {
        let queue = self.per_source.entry(source_id.clone()).or_default();
        push_bounded(queue, result, PER_SOURCE_CAPACITY);
    }

    /// Up to `limit` run results, newest first
    pub fn recent(&self, limit: usize) -> Vec<SyncResult> {
        self.recent.iter().rev().take(limit).cloned().collect()
    }

    /// Pass results for one source, newest first
    pub fn for_source(&self, source_id: &SourceId) -> Vec<SyncResult> {
        self.per_source
            .get(source_id)
            .map(|queue| queue.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&mut self, source_id: &SourceId) {
        self.per_source.remove(source_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn result(n: i64) -> SyncResult {
        SyncResult::started(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(n))
    }

    #[test]
    fn test_recent_is_bounded_and_newest_first() {
        let mut history = ResultHistory::new();
        for n in 0..(RECENT_CAPACITY as i64 + 5) {
            history.record_run(result(n));
        }

        let all = history.recent(usize::MAX);
        assert_eq!(all.len(), RECENT_CAPACITY);
        assert_eq!(all[0], result(RECENT_CAPACITY as i64 + 4));
        assert_eq!(history.recent(2).len(), 2);
    }

    #[test]
    fn test_per_source_history() {
        let work = SourceId::new("work".to_string()).unwrap();
        let mut history = ResultHistory::new();
        for n in 0..(PER_SOURCE_CAPACITY as i64 + 1) {
            history.record_pass(&work, result(n));
        }

        assert_eq!(history.for_source(&work).len(), PER_SOURCE_CAPACITY);
        history.forget(&work);
        assert!(history.for_source(&work).is_empty());
    }
}
