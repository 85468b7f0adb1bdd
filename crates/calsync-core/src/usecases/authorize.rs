//! Credential use case
//!
//! Resolves credentials for sources and the destination, refreshes them when
//! they are expired or rejected, and keeps each source's [`AuthState`] in
//! step with the outcome.
//!
//! ## Design Notes
//!
//! - When a source is flagged `needs_reauth`, the fingerprint of the
//!   credential it had resolved is remembered. Later passes skip the source
//!   (no refresh, no provider call) until the credential provider resolves a
//!   different, unexpired credential.
//! - Fingerprints live in memory only. After a restart a flagged source with
//!   an unexpired credential gets one attempt, which re-flags it if the
//!   credential is still rejected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    domain::{AuthState, SourceId, SyncDestination, SyncSource},
    ports::{Credential, CredentialError, ICredentialProvider, ISyncStateStore},
};

fn fingerprint(credential: &Credential) -> String {
    let digest = Sha256::digest(credential.secret.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Credential fingerprints per source
#[derive(Default)]
struct SeenCredentials {
    /// Last credential resolved for the source
    resolved: HashMap<SourceId, String>,
    /// Credential the source was flagged with
    rejected: HashMap<SourceId, String>,
}

/// Use case for credential resolution and refresh
pub struct AuthorizeUseCase {
    credentials: Arc<dyn ICredentialProvider>,
    store: Arc<dyn ISyncStateStore>,
    seen: Mutex<SeenCredentials>,
}

impl AuthorizeUseCase {
    pub fn new(credentials: Arc<dyn ICredentialProvider>, store: Arc<dyn ISyncStateStore>) -> Self {
        Self {
            credentials,
            store,
            seen: Mutex::new(SeenCredentials::default()),
        }
    }

    /// Returns a usable credential for `source`
    ///
    /// 1. Resolves the credential by source id
    /// 2. For a source flagged `needs_reauth`, refuses an expired credential
    ///    or the one it was flagged with, and clears the flag otherwise
    /// 3. Refreshes an expired credential of a healthy source, flagging the
    ///    source when the refresh reports `AuthExpired`
    ///
    /// # Errors
    ///
    /// Propagates the credential provider's error. `AuthExpired` means the
    /// source needs re-authorization.
    pub async fn source_credential(&self, source: &SyncSource) -> Result<Credential, CredentialError> {
        let resolved = self.credentials.resolve(source.id()).await;
        if let Ok(ref credential) = resolved {
            self.remember_resolved(source.id(), credential);
        }

        if source.auth_state() == AuthState::NeedsReauth {
            let credential = resolved?;
            if credential.is_expired() || self.is_rejected(source.id(), &credential) {
                debug!(source = %source.id(), "Credential not renewed, skipping source");
                return Err(CredentialError::AuthExpired(format!(
                    "source {} needs re-authorization",
                    source.id()
                )));
            }
            info!(source = %source.id(), "Source re-authorized");
            self.forget_rejected(source.id());
            self.mark(source, AuthState::Ok).await;
            return Ok(credential);
        }

        let credential = match resolved {
            Ok(credential) if credential.is_expired() => {
                debug!(source = %source.id(), "Credential expired, refreshing");
                self.credentials.refresh(&credential).await
            }
            other => other,
        };

        if let Err(CredentialError::AuthExpired(_)) = credential {
            self.mark(source, AuthState::NeedsReauth).await;
        }
        credential
    }

    /// Refreshes a credential a provider rejected mid-pass
    ///
    /// # Errors
    ///
    /// Returns `AuthExpired` (and flags the source) when the refresh fails.
    pub async fn refresh_rejected(
        &self,
        source: &SyncSource,
        rejected: &Credential,
    ) -> Result<Credential, CredentialError> {
        match self.credentials.refresh(rejected).await {
            Ok(credential) => {
                debug!(source = %source.id(), "Refreshed rejected credential");
                Ok(credential)
            }
            Err(err) => {
                if matches!(err, CredentialError::AuthExpired(_)) {
                    self.mark(source, AuthState::NeedsReauth).await;
                }
                Err(err)
            }
        }
    }

    /// Returns a usable credential for the destination
    ///
    /// # Errors
    ///
    /// Propagates the credential provider's error.
    pub async fn destination_credential(
        &self,
        destination: &SyncDestination,
    ) -> Result<Credential, CredentialError> {
        let credential = self.credentials.resolve_destination(&destination.id).await?;
        if credential.is_expired() {
            debug!(destination = %destination.id, "Destination credential expired, refreshing");
            return self.credentials.refresh(&credential).await;
        }
        Ok(credential)
    }

    /// Refreshes a destination credential the destination adapter rejected
    ///
    /// # Errors
    ///
    /// Propagates the credential provider's error.
    pub async fn refresh_destination(&self, rejected: &Credential) -> Result<Credential, CredentialError> {
        self.credentials.refresh(rejected).await
    }

    /// Flags a source whose refreshed credential was rejected again
    pub async fn mark_needs_reauth(&self, source: &SyncSource) {
        self.mark(source, AuthState::NeedsReauth).await;
    }

    fn remember_resolved(&self, source_id: &SourceId, credential: &Credential) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.resolved.insert(source_id.clone(), fingerprint(credential));
        }
    }

    fn is_rejected(&self, source_id: &SourceId, credential: &Credential) -> bool {
        let Ok(seen) = self.seen.lock() else {
            return false;
        };
        seen.rejected
            .get(source_id)
            .is_some_and(|rejected| *rejected == fingerprint(credential))
    }

    /// The last resolved credential is the one the provider refused
    fn remember_rejected(&self, source_id: &SourceId) {
        if let Ok(mut seen) = self.seen.lock() {
            if let Some(resolved) = seen.resolved.get(source_id).cloned() {
                seen.rejected.insert(source_id.clone(), resolved);
            }
        }
    }

    fn forget_rejected(&self, source_id: &SourceId) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.rejected.remove(source_id);
        }
    }

    async fn mark(&self, source: &SyncSource, state: AuthState) {
        if state == AuthState::NeedsReauth {
            warn!(source = %source.id(), "Credential cannot be refreshed, source needs re-authorization");
            self.remember_rejected(source.id());
        }
        if let Err(e) = self.store.set_auth_state(source.id(), state).await {
            warn!(source = %source.id(), error = %e, "Failed to persist auth state");
        }
    }
}
