//! Full-text index over archived message bodies.
//!
//! The index lives in a companion libSQL database holding an FTS5 table. Each
//! document carries the archive it belongs to and the peer it was exchanged
//! with, so index queries apply the same scoping as store queries. The index is
//! eventually consistent: `update` picks up messages stored since the last run,
//! `rebuild` recreates it from the archive.

mod documents;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jid::Jid;
use libsql::{Connection, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ArchiveConfig;
use crate::error::MamError;
use crate::metrics;
use crate::store::{ArchiveStore, Page, Scope};
use crate::types::to_millis;

pub use documents::{documents_for, quote_terms, DocumentKind, IndexDocument};

const SCHEMA: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS message_fts USING fts5(
    body,
    message_id UNINDEXED,
    kind UNINDEXED,
    owner UNINDEXED,
    with_bare UNINDEXED,
    with_resource UNINDEXED,
    nickname UNINDEXED,
    sent_date UNINDEXED,
    pm_from UNINDEXED,
    pm_to UNINDEXED
);

CREATE TABLE IF NOT EXISTS index_state (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

const WATERMARK_KEY: &str = "last_stored_seq";
const BATCH_SIZE: usize = 500;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Filter of a full-text search.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub scope: Scope,
    pub with: Option<Jid>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Free text, one or more terms
    pub text: String,
}

impl IndexQuery {
    fn where_clause(&self, page: Option<&Page>) -> Result<(String, Vec<Value>), MamError> {
        let terms = quote_terms(&self.text)
            .ok_or_else(|| MamError::bad_request(Some("Empty full-text query".to_string())))?;

        let mut clauses = vec![
            "message_fts MATCH ?".to_string(),
            "CAST(sent_date AS INTEGER) >= ?".to_string(),
            "CAST(sent_date AS INTEGER) <= ?".to_string(),
        ];
        let mut params: Vec<Value> = vec![
            terms.into(),
            to_millis(self.start).into(),
            to_millis(self.end).into(),
        ];

        match &self.scope {
            Scope::Personal { owner } => {
                clauses.push("kind = 'personal' AND owner = ?".to_string());
                params.push(owner.to_string().into());
            }
            Scope::Room {
                room,
                message_owner,
            } => {
                clauses.push(
                    "kind = 'room' AND owner = ? AND (pm_to IS NULL OR pm_to = ? OR pm_from = ?)"
                        .to_string(),
                );
                let message_owner = message_owner.to_string();
                params.push(room.to_string().into());
                params.push(message_owner.clone().into());
                params.push(message_owner.into());
            }
        }

        if let Some(with) = &self.with {
            let bare = with.to_bare();
            match (with.resource(), &self.scope) {
                // an occupant JID addresses the sender by nickname
                (Some(resource), Scope::Room { room, .. }) if bare == *room => {
                    clauses.push("nickname = ?".to_string());
                    params.push(resource.as_str().to_string().into());
                }
                (Some(resource), _) => {
                    clauses.push("with_bare = ? AND with_resource = ?".to_string());
                    params.push(bare.to_string().into());
                    params.push(resource.as_str().to_string().into());
                }
                (None, _) => {
                    clauses.push("with_bare = ?".to_string());
                    params.push(bare.to_string().into());
                }
            }
        }

        if let Some(page) = page {
            if let Some(after) = page.after {
                clauses.push("CAST(message_id AS INTEGER) > ?".to_string());
                params.push(after.into());
            }
            if let Some(before) = page.before {
                clauses.push("CAST(message_id AS INTEGER) < ?".to_string());
                params.push(before.into());
            }
        }

        Ok((clauses.join(" AND "), params))
    }
}

/// FTS5-backed message index.
pub struct FullTextIndex {
    conn: Arc<Mutex<Connection>>,
    store: Arc<dyn ArchiveStore>,
    config: Arc<ArchiveConfig>,
    initialized: AtomicBool,
    rebuilding: AtomicBool,
    /// Serializes rebuilds; a superseded rebuild releases it once it stops
    rebuild_lock: Mutex<()>,
    current_rebuild: std::sync::Mutex<Option<CancellationToken>>,
    progress: watch::Sender<Option<u8>>,
}

impl FullTextIndex {
    pub fn new(conn: Connection, store: Arc<dyn ArchiveStore>, config: Arc<ArchiveConfig>) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            store,
            config,
            initialized: AtomicBool::new(false),
            rebuilding: AtomicBool::new(false),
            rebuild_lock: Mutex::new(()),
            current_rebuild: std::sync::Mutex::new(None),
            progress,
        }
    }

    /// Open the index at `path`, or in memory when no path is configured.
    pub async fn open(
        path: Option<&Path>,
        store: Arc<dyn ArchiveStore>,
        config: Arc<ArchiveConfig>,
    ) -> Result<Self, MamError> {
        let db = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        MamError::index(format!("Failed to create index directory: {}", e))
                    })?;
                }
                libsql::Builder::new_local(path).build().await
            }
            None => libsql::Builder::new_local(":memory:").build().await,
        }
        .map_err(index_error)?;

        let index = Self::new(db.connect().map_err(index_error)?, store, config);
        index.initialize().await?;
        Ok(index)
    }

    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), MamError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        conn.execute_batch(SCHEMA).await.map_err(index_error)?;
        self.initialized.store(true, Ordering::Release);
        debug!("Full-text index schema initialized");
        Ok(())
    }

    /// Store position of the last indexed message, `None` when the index was
    /// never built.
    pub async fn watermark(&self) -> Result<Option<i64>, MamError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT value FROM index_state WHERE key = ?1",
                libsql::params![WATERMARK_KEY],
            )
            .await
            .map_err(index_error)?;
        match rows.next().await.map_err(index_error)? {
            Some(row) => {
                let value: i64 = row.get(0).map_err(index_error)?;
                Ok((value > 0).then_some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, seq: i64) -> Result<(), MamError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO index_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            libsql::params![WATERMARK_KEY, seq],
        )
        .await
        .map_err(index_error)?;
        Ok(())
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    /// Rebuild progress in percent, `None` when no rebuild runs.
    pub fn progress(&self) -> watch::Receiver<Option<u8>> {
        self.progress.subscribe()
    }

    /// Index messages stored since the last update. Returns the number of
    /// messages indexed.
    #[instrument(skip(self))]
    pub async fn update(&self) -> Result<usize, MamError> {
        // bodies are only stored when message or room archiving is on
        if !self.config.archiving.messages && !self.config.archiving.rooms {
            debug!("Message archiving disabled, skipping index update");
            return Ok(0);
        }
        if self.is_rebuilding() {
            debug!("Rebuild in progress, skipping index update");
            return Ok(0);
        }

        let after = self.watermark().await?.unwrap_or(0);
        let indexed = self.index_from(after, None, 0).await?;
        if indexed > 0 {
            info!(indexed, "Full-text index updated");
        }
        Ok(indexed)
    }

    /// Recreate the index from the archive in a background task.
    ///
    /// A rebuild already running is superseded: it stops before its next
    /// document and the new one starts from scratch.
    pub fn rebuild(self: &Arc<Self>) -> JoinHandle<Result<usize, MamError>> {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .current_rebuild
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(token.clone())
        {
            info!("Superseding running index rebuild");
            previous.cancel();
        }

        let index = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = index.rebuild_lock.lock().await;
            if token.is_cancelled() {
                return Ok(0);
            }
            index.rebuilding.store(true, Ordering::Release);
            index.progress.send_replace(Some(0));

            let result = index.run_rebuild(&token).await;

            if !token.is_cancelled() {
                index.rebuilding.store(false, Ordering::Release);
                index.progress.send_replace(None);
            }
            result
        })
    }

    async fn run_rebuild(&self, token: &CancellationToken) -> Result<usize, MamError> {
        info!("Rebuilding full-text index");
        {
            let conn = self.conn.lock().await;
            conn.execute("DELETE FROM message_fts", ())
                .await
                .map_err(index_error)?;
        }
        self.set_watermark(0).await?;

        let total = self.store.count_for_index(0).await?.max(0) as usize;
        let indexed = self.index_from(0, Some(token), total).await?;
        if token.is_cancelled() {
            info!(indexed, "Index rebuild superseded");
        } else {
            info!(indexed, "Full-text index rebuilt");
        }
        Ok(indexed)
    }

    /// Index everything stored after position `after_seq`, advancing the
    /// watermark per batch.
    async fn index_from(
        &self,
        after_seq: i64,
        token: Option<&CancellationToken>,
        total: usize,
    ) -> Result<usize, MamError> {
        let mut cursor = after_seq;
        let mut indexed = 0usize;
        let mut last_log = Instant::now();

        loop {
            let batch = self.store.messages_for_index(cursor, BATCH_SIZE).await?;
            if batch.is_empty() {
                return Ok(indexed);
            }

            for message in &batch {
                if token.is_some_and(|t| t.is_cancelled()) {
                    return Ok(indexed);
                }
                let documents = documents_for(message, &self.config.server);
                self.add_documents(&documents).await?;
                cursor = message.stored_seq;
                indexed += 1;

                if token.is_some() && total > 0 {
                    let percent = ((indexed * 100) / total).min(100) as u8;
                    self.progress.send_if_modified(|current| {
                        if *current == Some(percent) {
                            return false;
                        }
                        *current = Some(percent);
                        true
                    });
                    if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                        info!(indexed, total, percent, "Index rebuild progress");
                        last_log = Instant::now();
                    }
                }
            }

            metrics::record_indexed(batch.len());
            self.set_watermark(cursor).await?;
        }
    }

    async fn add_documents(&self, documents: &[IndexDocument]) -> Result<(), MamError> {
        let conn = self.conn.lock().await;
        for document in documents {
            let params: Vec<Value> = vec![
                document.body.clone().into(),
                document.message_id.into(),
                document.kind.as_str().into(),
                document.owner.clone().into(),
                document.with_bare.clone().into(),
                optional_text(document.with_resource.as_deref()),
                optional_text(document.nickname.as_deref()),
                to_millis(document.sent_date).into(),
                optional_text(document.pm_from.as_deref()),
                optional_text(document.pm_to.as_deref()),
            ];
            conn.execute(
                "INSERT INTO message_fts (body, message_id, kind, owner, with_bare, with_resource, \
                 nickname, sent_date, pm_from, pm_to) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params,
            )
            .await
            .map_err(index_error)?;
        }
        Ok(())
    }

    /// Drop the documents of messages deleted from the archive.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn remove_messages(&self, ids: &[i64]) -> Result<u64, MamError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.initialize().await?;
        let conn = self.conn.lock().await;
        let mut removed = 0;
        for chunk in ids.chunks(BATCH_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let params: Vec<Value> = chunk.iter().map(|id| Value::from(*id)).collect();
            removed += conn
                .execute(
                    &format!(
                        "DELETE FROM message_fts WHERE CAST(message_id AS INTEGER) IN ({placeholders})"
                    ),
                    params,
                )
                .await
                .map_err(index_error)?;
        }
        debug!(removed, "Removed purged messages from the full-text index");
        Ok(removed)
    }

    /// Archive ids of matching messages for one page, in the page's order.
    #[instrument(skip(self, query), fields(archive = %query.scope.archive_jid()))]
    pub async fn search(&self, query: &IndexQuery, page: &Page) -> Result<Vec<i64>, MamError> {
        self.initialize().await?;
        let (where_clause, params) = query.where_clause(Some(page))?;
        let order = if page.backwards { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT DISTINCT CAST(message_id AS INTEGER) AS id, CAST(sent_date AS INTEGER) AS sent \
             FROM message_fts WHERE {where_clause} ORDER BY sent {order}, id {order} LIMIT {}",
            page.limit
        );

        let conn = self.conn.lock().await;
        let mut rows = conn.query(&sql, params).await.map_err(index_error)?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(index_error)? {
            ids.push(row.get::<i64>(0).map_err(index_error)?);
        }
        Ok(ids)
    }

    /// Number of matching messages, -1 when the index cannot tell.
    pub async fn count(&self, query: &IndexQuery) -> i64 {
        match self.try_count(query).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Full-text count failed");
                -1
            }
        }
    }

    async fn try_count(&self, query: &IndexQuery) -> Result<i64, MamError> {
        self.initialize().await?;
        let (where_clause, params) = query.where_clause(None)?;
        let sql = format!("SELECT COUNT(DISTINCT message_id) FROM message_fts WHERE {where_clause}");

        let conn = self.conn.lock().await;
        let mut rows = conn.query(&sql, params).await.map_err(index_error)?;
        match rows.next().await.map_err(index_error)? {
            Some(row) => row.get::<i64>(0).map_err(index_error),
            None => Ok(0),
        }
    }
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::Text(v.to_string()))
}

fn index_error(e: libsql::Error) -> MamError {
    MamError::index(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::store::LibSqlArchiveStore;
    use crate::types::{from_millis, MessageRecord};

    fn record(id: i64, from: &str, to: &str, body: &str) -> MessageRecord {
        MessageRecord {
            id,
            conversation_id: None,
            from: from.parse().unwrap(),
            to: to.parse().unwrap(),
            sent_date: from_millis(id * 1_000),
            body: Some(body.to_string()),
            stanza: None,
            is_pm_for: None,
            groupchat: false,
        }
    }

    async fn index_with(records: &[MessageRecord]) -> Arc<FullTextIndex> {
        let config = load_config_from_str(
            "[server]\ndomain = \"capulet.lit\"\n[archiving]\nmessages = true\n",
        )
        .unwrap();
        let store = Arc::new(LibSqlArchiveStore::in_memory().await.unwrap());
        store.insert_messages(records).await.unwrap();
        Arc::new(
            FullTextIndex::open(None, store, Arc::new(config))
                .await
                .unwrap(),
        )
    }

    fn query(owner: &str, text: &str) -> IndexQuery {
        IndexQuery {
            scope: Scope::Personal {
                owner: owner.parse().unwrap(),
            },
            with: None,
            start: from_millis(0),
            end: from_millis(1_000_000),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_update_indexes_new_messages_once() {
        let index = index_with(&[
            record(1, "juliet@capulet.lit", "nurse@capulet.lit", "where is romeo"),
            record(2, "nurse@capulet.lit", "juliet@capulet.lit", "at the orchard"),
        ])
        .await;

        assert_eq!(index.watermark().await.unwrap(), None);
        assert_eq!(index.update().await.unwrap(), 2);
        assert_eq!(index.watermark().await.unwrap(), Some(2));
        assert_eq!(index.update().await.unwrap(), 0);

        let ids = index
            .search(&query("juliet@capulet.lit", "orchard"), &Page::forward(10))
            .await
            .unwrap();
        assert_eq!(ids, vec![2]);
        assert_eq!(index.count(&query("nurse@capulet.lit", "romeo")).await, 1);
        assert_eq!(index.count(&query("romeo@montague.lit", "romeo")).await, 0);
    }

    #[tokio::test]
    async fn test_late_batch_with_lower_id_is_indexed() {
        let config = load_config_from_str(
            "[server]\ndomain = \"capulet.lit\"\n[archiving]\nmessages = true\n",
        )
        .unwrap();
        let store = Arc::new(LibSqlArchiveStore::in_memory().await.unwrap());
        let index = Arc::new(
            FullTextIndex::open(None, store.clone(), Arc::new(config))
                .await
                .unwrap(),
        );

        store
            .insert_messages(&[record(6, "juliet@capulet.lit", "nurse@capulet.lit", "good night")])
            .await
            .unwrap();
        assert_eq!(index.update().await.unwrap(), 1);

        // id 5 was allocated first but its batch reached the store second
        store
            .insert_messages(&[record(5, "nurse@capulet.lit", "juliet@capulet.lit", "wherefore")])
            .await
            .unwrap();
        assert_eq!(index.update().await.unwrap(), 1);

        let q = query("juliet@capulet.lit", "wherefore");
        assert_eq!(index.search(&q, &Page::forward(10)).await.unwrap(), vec![5]);
        assert_eq!(index.count(&q).await, 1);
    }

    #[tokio::test]
    async fn test_removed_messages_leave_search_results() {
        let index = index_with(&[
            record(1, "juliet@capulet.lit", "nurse@capulet.lit", "good night"),
            record(2, "juliet@capulet.lit", "nurse@capulet.lit", "good night again"),
        ])
        .await;
        index.update().await.unwrap();

        assert_eq!(index.remove_messages(&[1]).await.unwrap(), 2);
        let q = query("juliet@capulet.lit", "night");
        assert_eq!(index.search(&q, &Page::forward(10)).await.unwrap(), vec![2]);
        assert_eq!(index.count(&q).await, 1);
    }

    #[tokio::test]
    async fn test_search_pages_by_id() {
        let index = index_with(&[
            record(1, "juliet@capulet.lit", "nurse@capulet.lit", "good night"),
            record(2, "juliet@capulet.lit", "nurse@capulet.lit", "good night again"),
            record(3, "juliet@capulet.lit", "nurse@capulet.lit", "good night once more"),
        ])
        .await;
        index.update().await.unwrap();

        let q = query("juliet@capulet.lit", "good night");
        let mut page = Page::forward(2);
        assert_eq!(index.search(&q, &page).await.unwrap(), vec![1, 2]);
        page.after = Some(2);
        assert_eq!(index.search(&q, &page).await.unwrap(), vec![3]);

        let backwards = Page::backward(1);
        assert_eq!(index.search(&q, &backwards).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_fts_syntax_in_user_input_is_quoted() {
        let index = index_with(&[record(
            1,
            "juliet@capulet.lit",
            "nurse@capulet.lit",
            "parting is such sweet sorrow",
        )])
        .await;
        index.update().await.unwrap();

        let ids = index
            .search(&query("juliet@capulet.lit", "sweet OR \"NEAR("), &Page::forward(10))
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_reports_progress_and_resets() {
        let index = index_with(&[
            record(1, "juliet@capulet.lit", "nurse@capulet.lit", "one"),
            record(2, "juliet@capulet.lit", "nurse@capulet.lit", "two"),
        ])
        .await;
        index.update().await.unwrap();

        let indexed = index.rebuild().await.unwrap().unwrap();
        assert_eq!(indexed, 2);
        assert!(!index.is_rebuilding());
        assert_eq!(*index.progress().borrow(), None);
        assert_eq!(index.count(&query("juliet@capulet.lit", "one")).await, 1);
    }

    #[tokio::test]
    async fn test_superseded_rebuild_stops() {
        let index = index_with(&[record(1, "juliet@capulet.lit", "nurse@capulet.lit", "one")]).await;

        let first = index.rebuild();
        let second = index.rebuild();
        first.await.unwrap().unwrap();
        assert_eq!(second.await.unwrap().unwrap(), 1);
        assert_eq!(index.count(&query("juliet@capulet.lit", "one")).await, 1);
    }
}
