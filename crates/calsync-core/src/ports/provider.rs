//! Provider adapter port (driven/secondary port)
//!
//! One adapter per provider family fetches events from and writes events to
//! that provider's calendars. Adapters are selected by
//! [`ProviderType`] through a [`ProviderRegistry`].
//!
//! ## Design Notes
//!
//! - Errors are a closed [`ProviderError`] enum rather than `anyhow` because
//!   the controller's retry, refresh and reporting behaviour depends on the
//!   failure class.
//! - [`FetchPage`] is a port-level DTO; each page is reconciled and committed
//!   as one unit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::credentials::Credential;
use crate::domain::{
    newtypes::{CalendarId, DestEventId, SyncToken},
    result::ErrorKind,
    NormalizedEvent, ProviderType,
};

// ============================================================================
// Fetch request / response
// ============================================================================

/// What to fetch for one calendar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    /// Incremental changes since the stored cursor
    Delta(SyncToken),
    /// Everything in `[start, end)`; used when no cursor is stored
    Window {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl FetchRequest {
    /// Returns true for a windowed full fetch
    pub fn is_window(&self) -> bool {
        matches!(self, FetchRequest::Window { .. })
    }
}

/// One page of fetched changes
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    /// New or changed events, in provider order
    pub events: Vec<NormalizedEvent>,
    /// Provider event ids reported as deleted
    pub removed: Vec<String>,
    /// Cursor for the next fetch (next page while `has_more`, otherwise the
    /// next incremental fetch)
    pub next_token: Option<SyncToken>,
    pub has_more: bool,
}

// ============================================================================
// Errors
// ============================================================================

/// Failure classes reported by adapters and event feeds
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Credential rejected; refresh or re-authorization needed
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Provider throttled the request
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Provider's hint, when it sent one
        retry_after: Option<Duration>,
    },

    /// Calendar or event does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or server-side failure worth retrying
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The delta cursor was rejected (expired or reset upstream)
    #[error("Sync token rejected: {0}")]
    InvalidToken(String),
}

impl ProviderError {
    /// Returns true if retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }

    /// Taxonomy entry used in pass results
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::AuthExpired(_) => ErrorKind::AuthExpired,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::Transient(_) | ProviderError::InvalidToken(_) => ErrorKind::Transient,
        }
    }
}

// ============================================================================
// IProviderAdapter trait
// ============================================================================

/// Calendar operations for one provider family
#[async_trait::async_trait]
pub trait IProviderAdapter: Send + Sync {
    /// Fetch a page of events for `calendar_id`
    async fn fetch_events(
        &self,
        credential: &Credential,
        calendar_id: &CalendarId,
        request: &FetchRequest,
    ) -> Result<FetchPage, ProviderError>;

    /// Create `event` in `calendar_id`, returning the new event's id
    async fn write_event(
        &self,
        credential: &Credential,
        calendar_id: &CalendarId,
        event: &NormalizedEvent,
    ) -> Result<DestEventId, ProviderError>;

    /// Replace the content of an existing event
    ///
    /// Returns the (possibly reissued) event id.
    async fn update_event(
        &self,
        credential: &Credential,
        calendar_id: &CalendarId,
        event_id: &DestEventId,
        event: &NormalizedEvent,
    ) -> Result<DestEventId, ProviderError>;

    /// Read back an event; `Ok(None)` if it no longer exists
    async fn get_event(
        &self,
        credential: &Credential,
        calendar_id: &CalendarId,
        event_id: &DestEventId,
    ) -> Result<Option<NormalizedEvent>, ProviderError>;

    /// Delete an event; deleting a missing event is not an error
    async fn delete_event(
        &self,
        credential: &Credential,
        calendar_id: &CalendarId,
        event_id: &DestEventId,
    ) -> Result<(), ProviderError>;
}

// ============================================================================
// ProviderRegistry
// ============================================================================

/// Provider adapters keyed by provider family
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderType, Arc<dyn IProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the adapter for `provider`
    pub fn register(&mut self, provider: ProviderType, adapter: Arc<dyn IProviderAdapter>) {
        self.adapters.insert(provider, adapter);
    }

    /// Builder-style [`register`](Self::register)
    #[must_use]
    pub fn with(mut self, provider: ProviderType, adapter: Arc<dyn IProviderAdapter>) -> Self {
        self.register(provider, adapter);
        self
    }

    pub fn get(&self, provider: ProviderType) -> Option<Arc<dyn IProviderAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
