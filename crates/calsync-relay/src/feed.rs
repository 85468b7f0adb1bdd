//! `IEventFeed` over the agent inbox

use std::sync::Arc;

use calsync_core::domain::{CalendarId, SourceId, SyncToken};
use calsync_core::ports::{FetchPage, IEventFeed, ProviderError};

use crate::inbox::Inbox;

/// Serves pushed batches to the sync controller
#[derive(Clone)]
pub struct RelayFeed {
    inbox: Arc<Inbox>,
}

impl RelayFeed {
    pub fn new(inbox: Arc<Inbox>) -> Self {
        Self { inbox }
    }
}

#[async_trait::async_trait]
impl IEventFeed for RelayFeed {
    async fn fetch_batch(
        &self,
        source_id: &SourceId,
        calendar_id: &CalendarId,
        token: Option<&SyncToken>,
    ) -> Result<FetchPage, ProviderError> {
        self.inbox.next_after(source_id, calendar_id, token).await
    }
}
