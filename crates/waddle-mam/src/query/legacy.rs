use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use super::{ascending, PaginatedQuery};
use crate::error::MamError;
use crate::store::{ArchiveStore, Page, RoomLogFilter};
use crate::types::ArchivedMessage;

/// Reads a room archive from the host's room conversation log.
pub struct LegacyRoomQuery {
    store: Arc<dyn ArchiveStore>,
    filter: RoomLogFilter,
}

impl LegacyRoomQuery {
    pub fn new(store: Arc<dyn ArchiveStore>, filter: RoomLogFilter) -> Self {
        Self { store, filter }
    }
}

#[async_trait]
impl PaginatedQuery for LegacyRoomQuery {
    fn backend(&self) -> &'static str {
        "legacy"
    }

    #[instrument(skip(self), fields(room = %self.filter.room))]
    async fn page(&self, page: &Page) -> Result<Vec<ArchivedMessage>, MamError> {
        if page.limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.store.fetch_room_log(&self.filter, page).await?;
        let messages = records
            .into_iter()
            .map(|record| ArchivedMessage::from_record(&self.filter.room, record))
            .collect();
        Ok(ascending(messages, page))
    }

    async fn total_count(&self) -> Result<i64, MamError> {
        Ok(self.store.count_room_log(&self.filter).await?)
    }
}
