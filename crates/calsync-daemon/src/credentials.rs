//! Keyring-backed credential provider
//!
//! Credentials live in the system keyring under the service `calsync`, one
//! entry per source (`source:{id}`) and one for the destination
//! (`destination:{id}`). Each entry holds JSON:
//!
//! ```json
//! {"secret": "...", "expires_at": "2026-11-01T00:00:00Z"}
//! ```
//!
//! Obtaining and renewing credentials is done by external tooling; `refresh`
//! re-reads the entry and only succeeds if it now holds a different,
//! unexpired secret.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use calsync_core::domain::{DestinationId, SourceId};
use calsync_core::ports::{Credential, CredentialError, ICredentialProvider};

/// Keyring service name for calsync credentials
const KEYRING_SERVICE: &str = "calsync";

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    secret: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

fn source_entry(id: &SourceId) -> String {
    format!("source:{id}")
}

fn destination_entry(id: &DestinationId) -> String {
    format!("destination:{id}")
}

/// Parses a keyring entry into a credential for `reference`
fn parse_entry(reference: &str, json: &str) -> Result<Credential, CredentialError> {
    let stored: StoredCredential = serde_json::from_str(json).map_err(|e| {
        CredentialError::Missing(format!("malformed keyring entry for {reference}: {e}"))
    })?;
    let credential = Credential::new(reference, stored.secret);
    Ok(match stored.expires_at {
        Some(at) => credential.expiring_at(at),
        None => credential,
    })
}

fn read_entry(reference: &str) -> Result<String, CredentialError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, reference)
        .map_err(|e| CredentialError::Unavailable(format!("keyring entry {reference}: {e}")))?;

    match entry.get_password() {
        Ok(json) => Ok(json),
        Err(keyring::Error::NoEntry) => Err(CredentialError::Missing(reference.to_string())),
        Err(e) => Err(CredentialError::Unavailable(format!(
            "failed to read keyring entry {reference}: {e}"
        ))),
    }
}

/// Resolves source and destination credentials from the system keyring
#[derive(Debug, Default)]
pub struct KeyringCredentialProvider;

impl KeyringCredentialProvider {
    pub fn new() -> Self {
        Self
    }

    async fn load(&self, reference: String) -> Result<Credential, CredentialError> {
        let lookup = reference.clone();
        // Secret-service calls block on D-Bus
        let json = tokio::task::spawn_blocking(move || read_entry(&lookup))
            .await
            .map_err(|e| CredentialError::Unavailable(format!("keyring lookup aborted: {e}")))??;
        debug!(reference = %reference, "Loaded credential from keyring");
        parse_entry(&reference, &json)
    }
}

#[async_trait::async_trait]
impl ICredentialProvider for KeyringCredentialProvider {
    async fn resolve(&self, source_id: &SourceId) -> Result<Credential, CredentialError> {
        self.load(source_entry(source_id)).await
    }

    async fn resolve_destination(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Credential, CredentialError> {
        self.load(destination_entry(destination_id)).await
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError> {
        let fresh = self
            .load(credential.reference.clone())
            .await
            .map_err(|e| match e {
                CredentialError::Missing(reference) => CredentialError::AuthExpired(reference),
                other => other,
            })?;

        if fresh.is_expired() || fresh.secret == credential.secret {
            return Err(CredentialError::AuthExpired(format!(
                "credential {} has not been renewed",
                credential.reference
            )));
        }
        Ok(fresh)
    }
}
