//! Sync source domain entity
//!
//! A [`SyncSource`] is one upstream calendar account feeding the destination.
//! Configuration edits own most fields; the controller only ever touches the
//! token map, `last_sync` and the auth state, and always through the state
//! store.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    errors::DomainError,
    event::ProviderType,
    newtypes::{CalendarId, SourceId, SyncToken},
};

/// Which way events may flow for a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Source events are mirrored into the destination; destination events
    /// are never removed on the source's behalf
    #[default]
    ReadOnly,
    /// The source is only ever written to; nothing is pulled from it
    WriteOnly,
    /// Full mirror, including deletions
    Bidirectional,
}

impl SyncDirection {
    /// Returns true if events should be fetched from the source
    pub fn permits_fetch(&self) -> bool {
        !matches!(self, SyncDirection::WriteOnly)
    }

    /// Returns true if upstream removals may delete destination events
    pub fn permits_deletions(&self) -> bool {
        matches!(self, SyncDirection::Bidirectional)
    }
}

/// How often the scheduler runs a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    /// Shortest interval the scheduler supports
    RealTime,
    #[default]
    Hourly,
    Daily,
    /// Only on explicit request
    Manual,
}

/// Configured length of each scheduled frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyIntervals {
    pub real_time: Duration,
    pub hourly: Duration,
    pub daily: Duration,
}

impl Default for FrequencyIntervals {
    fn default() -> Self {
        Self {
            real_time: Duration::from_secs(5 * 60),
            hourly: Duration::from_secs(60 * 60),
            daily: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SyncFrequency {
    /// Interval between scheduled passes, `None` for [`SyncFrequency::Manual`]
    pub fn interval(&self, intervals: &FrequencyIntervals) -> Option<Duration> {
        match self {
            SyncFrequency::RealTime => Some(intervals.real_time),
            SyncFrequency::Hourly => Some(intervals.hourly),
            SyncFrequency::Daily => Some(intervals.daily),
            SyncFrequency::Manual => None,
        }
    }
}

/// How events reach the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    /// Fetched directly through a provider adapter
    #[default]
    Api,
    /// Pushed by a remote agent through the relay channel
    Agent,
}

/// Credential health of a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Ok,
    /// Credential expired and could not be refreshed; an operator must
    /// re-authorize before the source syncs again
    NeedsReauth,
}

impl AuthState {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Ok => "ok",
            AuthState::NeedsReauth => "needs_reauth",
        }
    }
}

/// A configured upstream calendar account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSource {
    id: SourceId,
    name: String,
    provider_type: ProviderType,
    #[serde(default)]
    connection_info: BTreeMap<String, String>,
    /// Reference handed to the credential provider (never the secret itself)
    #[serde(default)]
    credential_ref: Option<String>,
    #[serde(default)]
    sync_direction: SyncDirection,
    /// `None` falls back to the configuration's default frequency
    #[serde(default)]
    sync_frequency: Option<SyncFrequency>,
    #[serde(default)]
    sync_method: SyncMethod,
    #[serde(default)]
    calendars: Vec<CalendarId>,
    #[serde(default)]
    last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    sync_tokens: BTreeMap<CalendarId, SyncToken>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    auth_state: AuthState,
}

fn default_enabled() -> bool {
    true
}

impl SyncSource {
    /// Creates an enabled, never-synced source with default direction,
    /// frequency and method
    pub fn new(id: SourceId, name: impl Into<String>, provider_type: ProviderType) -> Self {
        Self {
            id,
            name: name.into(),
            provider_type,
            connection_info: BTreeMap::new(),
            credential_ref: None,
            sync_direction: SyncDirection::default(),
            sync_frequency: None,
            sync_method: SyncMethod::default(),
            calendars: Vec::new(),
            last_sync: None,
            sync_tokens: BTreeMap::new(),
            enabled: true,
            auth_state: AuthState::Ok,
        }
    }

    // --- Builder-style setters ---

    /// Sets the calendars to sync
    #[must_use]
    pub fn with_calendars(mut self, calendars: Vec<CalendarId>) -> Self {
        self.calendars = calendars;
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.sync_direction = direction;
        self
    }

    #[must_use]
    pub fn with_frequency(mut self, frequency: SyncFrequency) -> Self {
        self.sync_frequency = Some(frequency);
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: SyncMethod) -> Self {
        self.sync_method = method;
        self
    }

    #[must_use]
    pub fn with_credential_ref(mut self, reference: impl Into<String>) -> Self {
        self.credential_ref = Some(reference.into());
        self
    }

    #[must_use]
    pub fn with_connection_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_info.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    // --- Getters ---

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    pub fn connection_info(&self) -> &BTreeMap<String, String> {
        &self.connection_info
    }

    pub fn credential_ref(&self) -> Option<&str> {
        self.credential_ref.as_deref()
    }

    pub fn sync_direction(&self) -> SyncDirection {
        self.sync_direction
    }

    /// Configured frequency, if the source overrides the global default
    pub fn sync_frequency(&self) -> Option<SyncFrequency> {
        self.sync_frequency
    }

    /// Frequency after applying the configuration-wide default
    pub fn effective_frequency(&self, default: SyncFrequency) -> SyncFrequency {
        self.sync_frequency.unwrap_or(default)
    }

    pub fn sync_method(&self) -> SyncMethod {
        self.sync_method
    }

    /// Returns true if events arrive through a remote agent
    pub fn is_relayed(&self) -> bool {
        self.sync_method == SyncMethod::Agent
    }

    pub fn calendars(&self) -> &[CalendarId] {
        &self.calendars
    }

    /// Returns true if `calendar_id` is one of the source's calendars
    pub fn has_calendar(&self, calendar_id: &CalendarId) -> bool {
        self.calendars.contains(calendar_id)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    /// Stored incremental cursor for one calendar
    pub fn token(&self, calendar_id: &CalendarId) -> Option<&SyncToken> {
        self.sync_tokens.get(calendar_id)
    }

    pub fn sync_tokens(&self) -> &BTreeMap<CalendarId, SyncToken> {
        &self.sync_tokens
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state
    }

    // --- Mutators used by state stores ---

    /// Replaces the sync bookkeeping (for reconstitution from storage)
    pub fn restore_state(
        &mut self,
        sync_tokens: BTreeMap<CalendarId, SyncToken>,
        last_sync: Option<DateTime<Utc>>,
        auth_state: AuthState,
    ) {
        self.sync_tokens = sync_tokens;
        self.last_sync = last_sync;
        self.auth_state = auth_state;
    }

    /// Records a committed page: token (if any) and lastSync move together
    pub fn record_commit(
        &mut self,
        calendar_id: &CalendarId,
        token: Option<SyncToken>,
        last_sync: DateTime<Utc>,
    ) {
        if let Some(token) = token {
            self.sync_tokens.insert(calendar_id.clone(), token);
        }
        self.last_sync = Some(last_sync);
    }

    /// Stores a cursor without moving `last_sync`
    pub fn store_token(&mut self, calendar_id: &CalendarId, token: SyncToken) {
        self.sync_tokens.insert(calendar_id.clone(), token);
    }

    /// Drops the stored cursor so the next fetch for the calendar is a
    /// windowed full fetch
    pub fn clear_token(&mut self, calendar_id: &CalendarId) {
        self.sync_tokens.remove(calendar_id);
    }

    pub fn set_auth_state(&mut self, state: AuthState) {
        self.auth_state = state;
    }

    /// Keeps sync bookkeeping from `previous` when a configuration edit
    /// replaces this record
    ///
    /// Tokens for calendars that are no longer configured are dropped.
    pub fn inherit_state(&mut self, previous: &SyncSource) {
        self.last_sync = previous.last_sync;
        self.sync_tokens = previous
            .sync_tokens
            .iter()
            .filter(|(calendar, _)| self.calendars.contains(calendar))
            .map(|(calendar, token)| (calendar.clone(), token.clone()))
            .collect();
        self.auth_state = previous.auth_state;
    }

    /// Validates the configuration-owned fields
    ///
    /// # Errors
    /// Returns [`DomainError::ValidationFailed`] for a blank name or a
    /// repeated calendar id
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::ValidationFailed(format!(
                "source {} has an empty name",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for calendar in &self.calendars {
            if !seen.insert(calendar) {
                return Err(DomainError::ValidationFailed(format!(
                    "source {} lists calendar {} twice",
                    self.id, calendar
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal(id: &str) -> CalendarId {
        CalendarId::new(id.to_string()).unwrap()
    }

    fn source() -> SyncSource {
        SyncSource::new(
            SourceId::new("work".to_string()).unwrap(),
            "Work",
            ProviderType::Google,
        )
        .with_calendars(vec![cal("primary"), cal("team")])
    }

    #[test]
    fn test_defaults() {
        let s = source();
        assert!(s.is_enabled());
        assert_eq!(s.sync_direction(), SyncDirection::ReadOnly);
        assert_eq!(s.sync_method(), SyncMethod::Api);
        assert_eq!(s.auth_state(), AuthState::Ok);
        assert_eq!(s.effective_frequency(SyncFrequency::Daily), SyncFrequency::Daily);
        assert!(s.last_sync().is_none());
    }

    #[test]
    fn test_direction_permissions() {
        assert!(SyncDirection::ReadOnly.permits_fetch());
        assert!(!SyncDirection::ReadOnly.permits_deletions());
        assert!(!SyncDirection::WriteOnly.permits_fetch());
        assert!(SyncDirection::Bidirectional.permits_deletions());
    }

    #[test]
    fn test_frequency_intervals() {
        let intervals = FrequencyIntervals {
            real_time: Duration::from_secs(60),
            hourly: Duration::from_secs(1800),
            daily: Duration::from_secs(43_200),
        };
        assert_eq!(
            SyncFrequency::RealTime.interval(&intervals),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            SyncFrequency::Hourly.interval(&intervals),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(
            SyncFrequency::Daily.interval(&intervals),
            Some(Duration::from_secs(43_200))
        );
        assert_eq!(SyncFrequency::Manual.interval(&intervals), None);
        assert_eq!(
            SyncFrequency::Hourly.interval(&FrequencyIntervals::default()),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_record_commit_moves_token_and_last_sync() {
        let mut s = source();
        let now = Utc::now();
        s.record_commit(
            &cal("primary"),
            Some(SyncToken::new("t1".to_string()).unwrap()),
            now,
        );
        assert_eq!(s.token(&cal("primary")).unwrap().as_str(), "t1");
        assert_eq!(s.last_sync(), Some(now));

        s.record_commit(&cal("primary"), None, now);
        assert_eq!(s.token(&cal("primary")).unwrap().as_str(), "t1");

        s.clear_token(&cal("primary"));
        assert!(s.token(&cal("primary")).is_none());
    }

    #[test]
    fn test_inherit_state_drops_removed_calendars() {
        let mut old = source();
        let now = Utc::now();
        old.record_commit(&cal("primary"), Some(SyncToken::new("a".into()).unwrap()), now);
        old.record_commit(&cal("team"), Some(SyncToken::new("b".into()).unwrap()), now);
        old.set_auth_state(AuthState::NeedsReauth);

        let mut edited = SyncSource::new(old.id().clone(), "Work (renamed)", ProviderType::Google)
            .with_calendars(vec![cal("primary")]);
        edited.inherit_state(&old);

        assert_eq!(edited.token(&cal("primary")).unwrap().as_str(), "a");
        assert!(edited.token(&cal("team")).is_none());
        assert_eq!(edited.last_sync(), Some(now));
        assert_eq!(edited.auth_state(), AuthState::NeedsReauth);
    }

    #[test]
    fn test_validate() {
        assert!(source().validate().is_ok());

        let dup = source().with_calendars(vec![cal("x"), cal("x")]);
        assert!(dup.validate().is_err());

        let blank = SyncSource::new(
            SourceId::new("s".to_string()).unwrap(),
            " ",
            ProviderType::Apple,
        );
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let yaml = r#"
id: lab
name: Lab Exchange
provider_type: exchange
sync_method: agent
calendars: [Calendar]
"#;
        let s: SyncSource = serde_yaml::from_str(yaml).unwrap();
        assert!(s.is_relayed());
        assert!(s.is_enabled());
        assert_eq!(s.calendars().len(), 1);
    }
}
