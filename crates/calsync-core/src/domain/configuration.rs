//! The persisted sync configuration
//!
//! [`SyncConfiguration`] is the unit returned by the state store: all
//! sources, the destination, registered agents and the global settings.
//! It is passed explicitly to whoever needs it; nothing holds it globally.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    agent::AgentRegistration,
    destination::SyncDestination,
    errors::DomainError,
    newtypes::SourceId,
    source::{SyncFrequency, SyncSource},
};

/// Settings shared by every source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Frequency for sources that do not set one
    pub default_frequency: SyncFrequency,
    /// Days before today covered by a full (token-less) fetch
    pub window_past_days: u32,
    /// Days after today covered by a full fetch
    pub window_future_days: u32,
    /// Append "Synced from: <source>" to written descriptions
    pub annotate_origin: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            default_frequency: SyncFrequency::Hourly,
            window_past_days: 0,
            window_future_days: 90,
            annotate_origin: true,
        }
    }
}

impl GlobalSettings {
    /// Full-fetch window around `now`
    ///
    /// Anchored at midnight UTC of the current day so that repeated fetches
    /// on the same day request the same range.
    pub fn fetch_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let start = midnight - Duration::days(i64::from(self.window_past_days));
        let end = midnight + Duration::days(i64::from(self.window_future_days));
        (start, end)
    }

    /// # Errors
    /// Returns [`DomainError::ValidationFailed`] for an empty window
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.window_past_days == 0 && self.window_future_days == 0 {
            return Err(DomainError::ValidationFailed(
                "fetch window must cover at least one day".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sources, destination, agents and global settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    #[serde(default)]
    pub sources: Vec<SyncSource>,
    #[serde(default)]
    pub destination: Option<SyncDestination>,
    #[serde(default)]
    pub agents: Vec<AgentRegistration>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

impl SyncConfiguration {
    /// Looks up a source by id
    pub fn source(&self, id: &SourceId) -> Option<&SyncSource> {
        self.sources.iter().find(|s| s.id() == id)
    }

    /// Enabled sources, in configuration order
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SyncSource> {
        self.sources.iter().filter(|s| s.is_enabled())
    }
}
