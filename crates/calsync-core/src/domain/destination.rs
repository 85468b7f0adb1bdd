//! Sync destination domain entity
//!
//! The single calendar every source is consolidated into, together with the
//! conflict policy and the per-source presentation rules (category label,
//! colour, dedicated calendar).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{
    errors::DomainError,
    event::ProviderType,
    newtypes::{CalendarId, DestinationId, SourceId},
    source::SyncSource,
};

/// What to do when an already-synced event changed upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Overwrite the destination with the incoming content
    SourceWins,
    /// Keep the destination, drop the incoming change
    DestinationWins,
    /// Later `updated_at` wins; ties keep the destination
    #[default]
    LatestWins,
    /// Leave the destination alone and report the conflict
    Manual,
}

impl ConflictPolicy {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::SourceWins => "source_wins",
            ConflictPolicy::DestinationWins => "destination_wins",
            ConflictPolicy::LatestWins => "latest_wins",
            ConflictPolicy::Manual => "manual",
        }
    }

    /// Parses a stored or configured policy name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source_wins" => Some(ConflictPolicy::SourceWins),
            "destination_wins" => Some(ConflictPolicy::DestinationWins),
            "latest_wins" => Some(ConflictPolicy::LatestWins),
            "manual" => Some(ConflictPolicy::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How sources are visually separated at the destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorManagement {
    /// Everything lands in the destination calendar, coloured per source
    #[default]
    Auto,
    /// Sources with an entry in `source_calendars` get their own calendar
    SeparateCalendar,
}

/// The consolidated calendar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDestination {
    pub id: DestinationId,
    pub name: String,
    pub provider_type: ProviderType,
    #[serde(default)]
    pub connection_info: BTreeMap<String, String>,
    #[serde(default)]
    pub credential_ref: Option<String>,
    pub calendar_id: CalendarId,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub color_management: ColorManagement,
    /// Category label attached to events of each source
    #[serde(default)]
    pub categories: BTreeMap<SourceId, String>,
    /// Dedicated destination calendar per source (separate_calendar mode)
    #[serde(default)]
    pub source_calendars: BTreeMap<SourceId, CalendarId>,
    /// Colour override per source
    #[serde(default)]
    pub colors: BTreeMap<SourceId, String>,
}

impl SyncDestination {
    /// Creates a destination with the default policy and no per-source rules
    pub fn new(
        id: DestinationId,
        name: impl Into<String>,
        provider_type: ProviderType,
        calendar_id: CalendarId,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            provider_type,
            connection_info: BTreeMap::new(),
            credential_ref: None,
            calendar_id,
            conflict_policy: ConflictPolicy::default(),
            color_management: ColorManagement::default(),
            categories: BTreeMap::new(),
            source_calendars: BTreeMap::new(),
            colors: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Calendar that receives events from `source_id`
    pub fn target_calendar(&self, source_id: &SourceId) -> &CalendarId {
        match self.color_management {
            ColorManagement::SeparateCalendar => self
                .source_calendars
                .get(source_id)
                .unwrap_or(&self.calendar_id),
            ColorManagement::Auto => &self.calendar_id,
        }
    }

    /// Category label for events from `source`, defaulting to its name
    pub fn category_for(&self, source: &SyncSource) -> String {
        self.categories
            .get(source.id())
            .cloned()
            .unwrap_or_else(|| source.name().to_string())
    }

    /// Colour for events from `source`: explicit override, else the
    /// provider family's default
    pub fn color_for(&self, source: &SyncSource) -> String {
        self.colors
            .get(source.id())
            .cloned()
            .unwrap_or_else(|| source.provider_type().default_color().to_string())
    }

    /// # Errors
    /// Returns [`DomainError::ValidationFailed`] for a blank name
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::ValidationFailed(format!(
                "destination {} has an empty name",
                self.id
            )));
        }
        Ok(())
    }
}
