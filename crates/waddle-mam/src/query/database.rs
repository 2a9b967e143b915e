use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use super::{ascending, PaginatedQuery};
use crate::error::MamError;
use crate::store::{ArchiveStore, MessageFilter, Page};
use crate::types::ArchivedMessage;

/// Reads the archive's own message table, personal or room scoped.
pub struct DatabaseQuery {
    store: Arc<dyn ArchiveStore>,
    filter: MessageFilter,
}

impl DatabaseQuery {
    pub fn new(store: Arc<dyn ArchiveStore>, filter: MessageFilter) -> Self {
        Self { store, filter }
    }

    pub fn filter(&self) -> &MessageFilter {
        &self.filter
    }
}

#[async_trait]
impl PaginatedQuery for DatabaseQuery {
    fn backend(&self) -> &'static str {
        "database"
    }

    #[instrument(skip(self), fields(archive = %self.filter.scope.archive_jid()))]
    async fn page(&self, page: &Page) -> Result<Vec<ArchivedMessage>, MamError> {
        if page.limit == 0 {
            return Ok(Vec::new());
        }
        let owner = self.filter.scope.archive_jid();
        let records = self.store.fetch_messages(&self.filter, page).await?;
        let messages = records
            .into_iter()
            .map(|record| ArchivedMessage::from_record(owner, record))
            .collect();
        Ok(ascending(messages, page))
    }

    async fn total_count(&self) -> Result<i64, MamError> {
        Ok(self.store.count_messages(&self.filter).await?)
    }
}
