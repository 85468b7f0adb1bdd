//! Remote agent registration
//!
//! Agents run inside networks the service cannot reach and push events for
//! exactly one relayed source. Only a SHA-256 hash of the agent's bearer
//! credential is kept.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{AgentId, SourceId};

/// Default push interval for agents, in minutes
pub const DEFAULT_AGENT_INTERVAL_MINUTES: u32 = 60;

/// Health of an agent as seen by monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    /// No check-in for more than twice the configured interval
    Stale,
    Disabled,
}

/// A registered remote agent bound to one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: AgentId,
    pub name: String,
    /// Free-form deployment label ("lab-network", "plant-3")
    #[serde(default)]
    pub environment: String,
    /// What the agent reads from ("outlook", "ics", ...)
    #[serde(default)]
    pub agent_type: String,
    pub source_id: SourceId,
    pub interval_minutes: u32,
    /// Hex SHA-256 of the bearer credential
    pub credential_hash: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_check_in: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl AgentRegistration {
    /// Push interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }

    /// Agent status at `now`
    ///
    /// Stale when more than `2 × interval` has passed since the last
    /// check-in, or since registration if the agent never checked in.
    pub fn status_at(&self, now: DateTime<Utc>) -> AgentStatus {
        if !self.enabled {
            return AgentStatus::Disabled;
        }
        let reference = self.last_check_in.unwrap_or(self.registered_at);
        let allowance = chrono::Duration::minutes(i64::from(self.interval_minutes) * 2);
        if now - reference > allowance {
            AgentStatus::Stale
        } else {
            AgentStatus::Active
        }
    }
}
