//! Event feed port
//!
//! Relayed sources have no provider to call; their events are pushed by a
//! remote agent and parked until the controller asks for them. A feed serves
//! those parked batches as [`FetchPage`]s so the controller reconciles them
//! exactly like provider pages.

use crate::domain::newtypes::{CalendarId, SourceId, SyncToken};

use super::provider::{FetchPage, ProviderError};

/// Producer of pushed event batches
#[async_trait::async_trait]
pub trait IEventFeed: Send + Sync {
    /// Next batch for `calendar_id` after `token`
    ///
    /// An empty page with `next_token == None` means nothing is pending.
    async fn fetch_batch(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
        token: Option<&SyncToken>,
    ) -> Result<FetchPage, ProviderError>;
}
