//! Credential provider port (driven/secondary port)
//!
//! Authentication flows live outside the core. The controller only asks for
//! an opaque credential per source (or for the destination) and asks for a
//! refresh when a provider rejects it.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::newtypes::{DestinationId, SourceId};

/// Opaque, refreshable credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Reference the credential was resolved from
    pub reference: String,
    /// Secret material understood by the matching adapter
    pub secret: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(reference: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            secret: secret.into(),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Returns true if the credential is past its expiry
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

// Keep secrets out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("reference", &self.reference)
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credential resolution failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    /// No credential is configured for the reference
    #[error("No credential for {0}")]
    Missing(String),

    /// The credential cannot be refreshed; re-authorization required
    #[error("Credential expired and could not be refreshed: {0}")]
    AuthExpired(String),

    /// Temporary failure talking to the credential backend
    #[error("Credential backend unavailable: {0}")]
    Unavailable(String),
}

/// Resolves and refreshes credentials
#[async_trait::async_trait]
pub trait ICredentialProvider: Send + Sync {
    /// Credential for a source
    async fn resolve(&self, source_id: &SourceId) -> Result<Credential, CredentialError>;

    /// Credential for the destination
    async fn resolve_destination(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Credential, CredentialError>;

    /// Exchange an expired or rejected credential for a fresh one
    async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let fresh = Credential::new("ref", "s3cret");
        assert!(!fresh.is_expired());

        let stale = Credential::new("ref", "s3cret")
            .expiring_at(Utc::now() - chrono::Duration::seconds(1));
        assert!(stale.is_expired());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", Credential::new("ref", "s3cret"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("s3cret"));
    }
}
