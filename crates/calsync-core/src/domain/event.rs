//! Normalized event model
//!
//! Provider-agnostic representation of a calendar event. Adapters translate
//! their native schema into [`NormalizedEvent`]; remote agents emit it
//! directly. Identity is `(provider, provider_event_id)` within one source
//! calendar, and [`NormalizedEvent::fingerprint`] captures user-visible
//! content so the controller can tell "unchanged" from "edited".

use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::DomainError;
use super::newtypes::{CalendarId, SourceId};

// ============================================================================
// Provider type
// ============================================================================

/// Calendar provider family, used to select a provider adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Google,
    Microsoft,
    Exchange,
    Apple,
    Custom,
}

impl ProviderType {
    /// Stable lowercase name, as stored and used in dedup keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Google => "google",
            ProviderType::Microsoft => "microsoft",
            ProviderType::Exchange => "exchange",
            ProviderType::Apple => "apple",
            ProviderType::Custom => "custom",
        }
    }

    /// Parse the stored lowercase name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "google" => Some(ProviderType::Google),
            "microsoft" => Some(ProviderType::Microsoft),
            "exchange" => Some(ProviderType::Exchange),
            "apple" => Some(ProviderType::Apple),
            "custom" => Some(ProviderType::Custom),
            _ => None,
        }
    }

    /// Destination colour assigned to events from this provider family
    /// when the destination has no explicit colour for the source
    #[must_use]
    pub fn default_color(&self) -> &'static str {
        match self {
            ProviderType::Google => "lightGreen",
            ProviderType::Microsoft => "lightBlue",
            ProviderType::Exchange => "lightTeal",
            ProviderType::Apple => "lightPurple",
            ProviderType::Custom => "lightYellow",
        }
    }
}

impl Display for ProviderType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event attributes
// ============================================================================

/// Lifecycle status reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Confirmed => "confirmed",
            EventStatus::Tentative => "tentative",
            EventStatus::Cancelled => "cancelled",
        }
    }
}

/// Event visibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Organizer or attendee of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventParticipant {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub response_status: Option<String>,
}

impl EventParticipant {
    /// Participant known only by e-mail address
    #[must_use]
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            response_status: None,
        }
    }
}

// ============================================================================
// NormalizedEvent
// ============================================================================

/// A calendar event in provider-agnostic form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub provider: ProviderType,
    /// Event id within the provider (stable across fetches)
    pub provider_event_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub organizer: Option<EventParticipant>,
    #[serde(default)]
    pub participants: Vec<EventParticipant>,
    #[serde(default)]
    pub recurring: bool,
    #[serde(default)]
    pub recurrence_pattern: Option<String>,
    /// Calendar the event was read from
    pub calendar_id: CalendarId,
    #[serde(default)]
    pub calendar_name: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
}

impl NormalizedEvent {
    /// Creates an event with the required fields; everything else defaults
    #[must_use]
    pub fn new(
        provider: ProviderType,
        provider_event_id: impl Into<String>,
        calendar_id: CalendarId,
        title: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider,
            provider_event_id: provider_event_id.into(),
            title: title.into(),
            description: None,
            location: None,
            start,
            end,
            all_day: false,
            organizer: None,
            participants: Vec::new(),
            recurring: false,
            recurrence_pattern: None,
            calendar_id,
            calendar_name: None,
            link: None,
            visibility: Visibility::default(),
            status: EventStatus::default(),
            categories: Vec::new(),
            color: None,
            created_at: updated_at,
            updated_at,
            last_synced: None,
        }
    }

    /// Globally unique identity string, `"{provider}_{provider_event_id}"`
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}_{}", self.provider, self.provider_event_id)
    }

    /// Key under which this event is tracked in the dedup index
    #[must_use]
    pub fn dedup_key(&self, source_id: &SourceId) -> String {
        dedup_key(
            source_id,
            &self.calendar_id,
            self.provider,
            &self.provider_event_id,
        )
    }

    /// Structural checks applied to events that arrive from agents and adapters
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidEvent`] for an empty id or title, or when
    /// the event ends before it starts
    pub fn validate(&self) -> Result<(), DomainError> {
        let invalid = |reason: &str| DomainError::InvalidEvent {
            id: self.provider_event_id.clone(),
            reason: reason.to_string(),
        };

        if self.provider_event_id.trim().is_empty() {
            return Err(invalid("provider event id is empty"));
        }
        if self.title.trim().is_empty() {
            return Err(invalid("title is empty"));
        }
        if self.end < self.start {
            return Err(invalid("end is before start"));
        }
        Ok(())
    }

    /// SHA-256 over the user-visible content, hex encoded
    ///
    /// Bookkeeping timestamps (`created_at`, `updated_at`, `last_synced`) are
    /// excluded. Participants and categories are hashed in sorted order so a
    /// provider reordering them does not count as an edit.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let mut feed = |label: &str, value: &str| {
            hasher.update(label.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.as_bytes());
            hasher.update([0x1e]);
        };

        feed("provider", self.provider.as_str());
        feed("id", &self.provider_event_id);
        feed("title", &self.title);
        feed("description", self.description.as_deref().unwrap_or(""));
        feed("location", self.location.as_deref().unwrap_or(""));
        feed("start", &self.start.to_rfc3339());
        feed("end", &self.end.to_rfc3339());
        feed("all_day", if self.all_day { "1" } else { "0" });
        match &self.organizer {
            Some(organizer) => feed("organizer", &participant_line(organizer)),
            None => feed("organizer", ""),
        }

        let mut participants: Vec<String> =
            self.participants.iter().map(participant_line).collect();
        participants.sort();
        for participant in &participants {
            feed("participant", participant);
        }

        feed("recurring", if self.recurring { "1" } else { "0" });
        feed(
            "recurrence",
            self.recurrence_pattern.as_deref().unwrap_or(""),
        );
        feed("calendar", self.calendar_id.as_str());
        feed("link", self.link.as_deref().unwrap_or(""));
        feed(
            "visibility",
            match self.visibility {
                Visibility::Public => "public",
                Visibility::Private => "private",
            },
        );
        feed("status", self.status.as_str());

        let mut categories = self.categories.clone();
        categories.sort();
        for category in &categories {
            feed("category", category);
        }
        feed("color", self.color.as_deref().unwrap_or(""));

        format!("{:x}", hasher.finalize())
    }
}

fn participant_line(p: &EventParticipant) -> String {
    format!(
        "{}|{}|{}",
        p.email.to_lowercase(),
        p.name.as_deref().unwrap_or(""),
        p.response_status.as_deref().unwrap_or("")
    )
}

/// Builds a dedup key from its parts
///
/// Format: `"{source_id}/{calendar_id}/{provider}:{provider_event_id}"`.
#[must_use]
pub fn dedup_key(
    source_id: &SourceId,
    calendar_id: &CalendarId,
    provider: ProviderType,
    provider_event_id: &str,
) -> String {
    format!("{source_id}/{calendar_id}/{provider}:{provider_event_id}")
}
