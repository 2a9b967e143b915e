use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{ascending, PaginatedQuery};
use crate::error::MamError;
use crate::index::{FullTextIndex, IndexQuery};
use crate::store::{ArchiveStore, Page};
use crate::types::ArchivedMessage;

/// Finds matching ids in the full-text index and loads the messages from the
/// archive store.
pub struct FullTextQuery {
    index: Arc<FullTextIndex>,
    store: Arc<dyn ArchiveStore>,
    query: IndexQuery,
}

impl FullTextQuery {
    pub fn new(index: Arc<FullTextIndex>, store: Arc<dyn ArchiveStore>, query: IndexQuery) -> Self {
        Self {
            index,
            store,
            query,
        }
    }
}

#[async_trait]
impl PaginatedQuery for FullTextQuery {
    fn backend(&self) -> &'static str {
        "fulltext"
    }

    #[instrument(skip(self), fields(archive = %self.query.scope.archive_jid()))]
    async fn page(&self, page: &Page) -> Result<Vec<ArchivedMessage>, MamError> {
        if page.limit == 0 {
            return Ok(Vec::new());
        }
        let owner = self.query.scope.archive_jid();
        let mut messages = Vec::new();
        for id in self.index.search(&self.query, page).await? {
            match self.store.get_message(id, &self.query.scope).await? {
                Some(record) => messages.push(ArchivedMessage::from_record(owner, record)),
                // purged since it was indexed
                None => debug!(id, "Indexed message no longer in the archive"),
            }
        }
        Ok(ascending(messages, page))
    }

    async fn total_count(&self) -> Result<i64, MamError> {
        Ok(self.index.count(&self.query).await)
    }
}
