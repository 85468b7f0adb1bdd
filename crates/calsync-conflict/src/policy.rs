//! Policy engine for conflict resolution
//!
//! Applies the destination's [`ConflictPolicy`] to an event whose content
//! changed upstream after it was written to the destination.

use chrono::{DateTime, Utc};
use tracing::trace;

use calsync_core::domain::ConflictPolicy;

use crate::error::ConflictError;

/// Outcome of applying a policy to a changed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Write the incoming content over the destination copy
    Overwrite,
    /// Leave the destination copy as it is and drop the change
    KeepDestination,
    /// Leave the destination copy and report a conflict
    Flag,
}

/// Engine evaluating one conflict policy
#[derive(Debug, Clone, Copy)]
pub struct PolicyEngine {
    policy: ConflictPolicy,
}

impl PolicyEngine {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Returns true if [`decide`](Self::decide) needs the destination copy's
    /// `updated_at`
    pub fn needs_destination_version(&self) -> bool {
        self.policy == ConflictPolicy::LatestWins
    }

    /// Decides what to do with a changed event
    ///
    /// `destination_updated_at` is only consulted by `latest_wins`, where the
    /// incoming change wins only if it is strictly newer; equal timestamps
    /// keep the destination.
    ///
    /// # Errors
    ///
    /// Returns [`ConflictError::MissingDestinationVersion`] when `latest_wins`
    /// is evaluated without a destination timestamp.
    pub fn decide(
        &self,
        incoming_updated_at: DateTime<Utc>,
        destination_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Decision, ConflictError> {
        let decision = match self.policy {
            ConflictPolicy::SourceWins => Decision::Overwrite,
            ConflictPolicy::DestinationWins => Decision::KeepDestination,
            ConflictPolicy::Manual => Decision::Flag,
            ConflictPolicy::LatestWins => {
                let destination = destination_updated_at.ok_or_else(|| {
                    ConflictError::MissingDestinationVersion(format!(
                        "incoming updated at {incoming_updated_at}"
                    ))
                })?;
                if incoming_updated_at > destination {
                    Decision::Overwrite
                } else {
                    Decision::KeepDestination
                }
            }
        };

        trace!(
            policy = %self.policy,
            incoming = %incoming_updated_at,
            destination = ?destination_updated_at,
            decision = ?decision,
            "Conflict policy evaluated"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t1() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_latest_wins_newer_incoming_overwrites() {
        let engine = PolicyEngine::new(ConflictPolicy::LatestWins);
        let decision = engine.decide(t1() + Duration::seconds(1), Some(t1())).unwrap();
        assert_eq!(decision, Decision::Overwrite);
    }

    #[test]
    fn test_latest_wins_older_incoming_keeps_destination() {
        let engine = PolicyEngine::new(ConflictPolicy::LatestWins);
        let decision = engine.decide(t1() - Duration::minutes(5), Some(t1())).unwrap();
        assert_eq!(decision, Decision::KeepDestination);
    }

    #[test]
    fn test_latest_wins_tie_keeps_destination() {
        let engine = PolicyEngine::new(ConflictPolicy::LatestWins);
        assert_eq!(engine.decide(t1(), Some(t1())).unwrap(), Decision::KeepDestination);
    }

    #[test]
    fn test_latest_wins_requires_destination_version() {
        let engine = PolicyEngine::new(ConflictPolicy::LatestWins);
        assert!(engine.needs_destination_version());
        assert!(matches!(
            engine.decide(t1(), None),
            Err(ConflictError::MissingDestinationVersion(_))
        ));
    }

    #[test]
    fn test_fixed_policies_ignore_timestamps() {
        let later = Some(t1() + Duration::days(1));
        assert_eq!(
            PolicyEngine::new(ConflictPolicy::SourceWins).decide(t1(), later).unwrap(),
            Decision::Overwrite
        );
        assert_eq!(
            PolicyEngine::new(ConflictPolicy::DestinationWins)
                .decide(t1() + Duration::days(2), later)
                .unwrap(),
            Decision::KeepDestination
        );
        assert_eq!(
            PolicyEngine::new(ConflictPolicy::Manual).decide(t1(), None).unwrap(),
            Decision::Flag
        );
        assert!(!PolicyEngine::new(ConflictPolicy::Manual).needs_destination_version());
    }
}
