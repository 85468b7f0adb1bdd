//! Configuration use case
//!
//! Validated edits of the persisted [`SyncConfiguration`]. The controller
//! wraps `remove_source` with its per-source lock; everything else is safe
//! to call while passes run.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    domain::{DomainError, GlobalSettings, SourceId, SyncConfiguration, SyncDestination, SyncSource},
    ports::ISyncStateStore,
};

/// Use case for configuration edits
pub struct ConfigureUseCase {
    store: Arc<dyn ISyncStateStore>,
}

impl ConfigureUseCase {
    pub fn new(store: Arc<dyn ISyncStateStore>) -> Self {
        Self { store }
    }

    /// Current configuration snapshot
    pub async fn get_configuration(&self) -> Result<SyncConfiguration> {
        self.store
            .get_configuration()
            .await
            .context("Failed to load sync configuration")
    }

    /// Adds a new source, rejecting an id that is already configured
    ///
    /// # Errors
    ///
    /// Fails with [`DomainError::Duplicate`] for a known id, or with the
    /// source's validation error.
    pub async fn add_source(&self, source: &SyncSource) -> Result<()> {
        source.validate()?;
        if self.store.get_source(source.id()).await?.is_some() {
            return Err(DomainError::Duplicate {
                kind: "source",
                id: source.id().to_string(),
            }
            .into());
        }
        self.store
            .upsert_source(source)
            .await
            .context("Failed to persist new source")?;
        info!(source = %source.id(), provider = %source.provider_type(), "Source added");
        Ok(())
    }

    /// Inserts or replaces a source after validating it
    pub async fn upsert_source(&self, source: &SyncSource) -> Result<()> {
        source.validate()?;
        self.store
            .upsert_source(source)
            .await
            .context("Failed to persist source")?;
        info!(source = %source.id(), enabled = source.is_enabled(), "Source saved");
        Ok(())
    }

    /// Removes a source and everything stored on its behalf
    ///
    /// Returns `false` if the id was unknown.
    pub async fn remove_source(&self, id: &SourceId) -> Result<bool> {
        let removed = self
            .store
            .remove_source(id)
            .await
            .context("Failed to remove source")?;
        if removed {
            info!(source = %id, "Source removed");
        }
        Ok(removed)
    }

    /// Validates and stores the destination
    pub async fn set_destination(&self, destination: &SyncDestination) -> Result<()> {
        destination.validate()?;
        self.store
            .set_destination(destination)
            .await
            .context("Failed to persist destination")?;
        info!(
            destination = %destination.id,
            policy = %destination.conflict_policy,
            "Destination configured"
        );
        Ok(())
    }

    /// Validates and stores the global settings
    pub async fn update_global_settings(&self, settings: &GlobalSettings) -> Result<()> {
        settings.validate()?;
        self.store
            .update_global_settings(settings)
            .await
            .context("Failed to persist global settings")
    }
}
