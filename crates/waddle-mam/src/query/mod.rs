//! Paginated archive queries.
//!
//! Each backend implements [`PaginatedQuery`]; [`QueryEngine`] picks one per
//! request, resolves cursor tokens and assembles the RSM metadata.

mod database;
mod engine;
mod fulltext;
mod legacy;

use async_trait::async_trait;

use crate::error::MamError;
use crate::store::Page;
use crate::types::ArchivedMessage;

pub use database::DatabaseQuery;
pub use engine::{ArchiveMetadata, QueryEngine, QueryPage, QueryRequest};
pub use fulltext::FullTextQuery;
pub use legacy::LegacyRoomQuery;

/// One filtered view of an archive that can be read page by page.
#[async_trait]
pub trait PaginatedQuery: Send + Sync {
    /// Backend label used in logs and metrics.
    fn backend(&self) -> &'static str;

    /// Up to `page.limit` messages within the cursor bounds, nearest the
    /// cursor first when paging backwards, returned in ascending order.
    async fn page(&self, page: &Page) -> Result<Vec<ArchivedMessage>, MamError>;

    /// Messages matching the filter regardless of cursors; -1 when unknown.
    async fn total_count(&self) -> Result<i64, MamError>;
}

/// Put a fetched page into ascending order.
pub(crate) fn ascending(mut messages: Vec<ArchivedMessage>, page: &Page) -> Vec<ArchivedMessage> {
    if page.backwards {
        messages.reverse();
    }
    messages
}
