use std::sync::Arc;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

use super::{DatabaseQuery, FullTextQuery, LegacyRoomQuery, PaginatedQuery};
use crate::config::{ArchiveConfig, RoomBackend};
use crate::error::MamError;
use crate::identifier::StableIdResolver;
use crate::index::{FullTextIndex, IndexQuery};
use crate::metrics;
use crate::store::{ArchiveStore, MessageFilter, Page, RoomLogFilter, Scope};
use crate::types::{from_millis, ArchivedMessage};

/// A MAM query after form and RSM parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// The archive being read: a user's bare JID or a room
    pub archive_owner: BareJid,
    /// Whose private room messages are visible; the requestor for room queries
    pub message_owner: BareJid,
    pub room: bool,
    pub with: Option<Jid>,
    /// Inclusive; the epoch when absent
    pub start: Option<DateTime<Utc>>,
    /// Inclusive; now when absent
    pub end: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub max: Option<i64>,
    pub backwards: bool,
    pub use_stable_ids: bool,
}

impl QueryRequest {
    pub fn personal(owner: BareJid) -> Self {
        Self {
            archive_owner: owner.clone(),
            message_owner: owner,
            room: false,
            with: None,
            start: None,
            end: None,
            text: None,
            after: None,
            before: None,
            max: None,
            backwards: false,
            use_stable_ids: true,
        }
    }

    pub fn room(room: BareJid, message_owner: BareJid) -> Self {
        Self {
            archive_owner: room,
            room: true,
            ..Self::personal(message_owner)
        }
    }

    fn scope(&self) -> Scope {
        if self.room {
            Scope::Room {
                room: self.archive_owner.clone(),
                message_owner: self.message_owner.clone(),
            }
        } else {
            Scope::Personal {
                owner: self.archive_owner.clone(),
            }
        }
    }
}

/// One page of results with its RSM metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPage {
    /// Always in ascending order
    pub messages: Vec<ArchivedMessage>,
    /// Matching messages regardless of paging; -1 when unknown
    pub total: i64,
    pub first: Option<String>,
    pub last: Option<String>,
    /// No further results exist in the paging direction
    pub complete: bool,
}

impl QueryPage {
    pub fn empty(total: i64) -> Self {
        Self {
            messages: Vec::new(),
            total,
            first: None,
            last: None,
            complete: true,
        }
    }
}

/// First and last message of an archive, as cursor tokens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveMetadata {
    pub first_id: String,
    pub first_time: DateTime<Utc>,
    pub last_id: String,
    pub last_time: DateTime<Utc>,
}

pub struct QueryEngine {
    config: Arc<ArchiveConfig>,
    store: Arc<dyn ArchiveStore>,
    index: Option<Arc<FullTextIndex>>,
    resolver: StableIdResolver,
}

impl QueryEngine {
    pub fn new(
        config: Arc<ArchiveConfig>,
        store: Arc<dyn ArchiveStore>,
        index: Option<Arc<FullTextIndex>>,
    ) -> Self {
        let resolver = StableIdResolver::new(store.clone());
        Self {
            config,
            store,
            index,
            resolver,
        }
    }

    fn legacy_rooms(&self) -> bool {
        self.config.store.room_backend == RoomBackend::Legacy
    }

    /// Answer a query with one page of results.
    #[instrument(
        skip(self, request),
        fields(archive = %request.archive_owner, room = request.room, backwards = request.backwards)
    )]
    pub async fn find_messages(&self, request: &QueryRequest) -> Result<QueryPage, MamError> {
        let max = match request.max {
            Some(max) if max <= 0 => {
                debug!("Zero-sized page requested, not querying");
                return Ok(QueryPage::empty(-1));
            }
            Some(max) => usize::try_from(max).unwrap_or(usize::MAX),
            None if request.room => self.config.query.room_default_max,
            None => self.config.query.default_max,
        };

        let started = std::time::Instant::now();
        match self.run(request, max).await {
            Ok((page, backend)) => {
                metrics::record_query(backend, started.elapsed().as_secs_f64() * 1000.0);
                debug!(
                    total = page.total,
                    returned = page.messages.len(),
                    complete = page.complete,
                    "Archive query answered"
                );
                Ok(page)
            }
            Err(e @ (MamError::NotFound(_) | MamError::Stanza { .. } | MamError::MissingIdentifier)) => {
                Err(e)
            }
            Err(e) if self.config.query.ignore_retrieval_exceptions => {
                warn!(error = %e, "Archive query failed, answering with an empty page");
                Ok(QueryPage::empty(0))
            }
            Err(e) => {
                error!(error = %e, "Archive query failed");
                Err(MamError::data_retrieval(e.to_string()))
            }
        }
    }

    async fn run(
        &self,
        request: &QueryRequest,
        max: usize,
    ) -> Result<(QueryPage, &'static str), MamError> {
        let now = Utc::now();
        let mut start = request.start.unwrap_or_else(|| from_millis(0));
        if let Some(limit) = self.config.conversation.max_retrievable() {
            start = start.max(now - limit);
        }
        let end = request.end.unwrap_or(now);

        let scope = request.scope();
        let legacy = request.room && self.legacy_rooms();
        let text = request
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        // one anchor only: the one in the paging direction when both are given
        let (after, before) = match (request.after.as_deref(), request.before.as_deref()) {
            (Some(_), Some(before)) if request.backwards => (None, Some(before)),
            (Some(after), _) => (Some(after), None),
            (None, before) => (None, before),
        };
        let page = Page {
            after: self.resolve(after, &scope, legacy, request).await?,
            before: self.resolve(before, &scope, legacy, request).await?,
            limit: max,
            backwards: request.backwards,
        };

        let query: Box<dyn PaginatedQuery> = match (text, legacy) {
            (Some(_), true) => {
                return Err(MamError::feature_not_implemented(Some(
                    "Full-text search is not available for this room".to_string(),
                )))
            }
            (Some(text), false) => {
                let index = self.index.clone().ok_or_else(|| {
                    MamError::feature_not_implemented(Some(
                        "Full-text search is disabled".to_string(),
                    ))
                })?;
                Box::new(FullTextQuery::new(
                    index,
                    self.store.clone(),
                    IndexQuery {
                        scope: scope.clone(),
                        with: request.with.clone(),
                        start,
                        end,
                        text: text.to_string(),
                    },
                ))
            }
            (None, true) => Box::new(LegacyRoomQuery::new(
                self.store.clone(),
                RoomLogFilter {
                    room: request.archive_owner.clone(),
                    with: request.with.clone(),
                    start,
                    end,
                },
            )),
            (None, false) => Box::new(DatabaseQuery::new(
                self.store.clone(),
                MessageFilter {
                    scope: scope.clone(),
                    with: request.with.clone(),
                    start,
                    end,
                },
            )),
        };
        let backend = query.backend();

        let total = query.total_count().await?;
        if total == 0 {
            return Ok((QueryPage::empty(0), backend));
        }

        let messages = query.page(&page).await?;
        let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
            return Ok((QueryPage::empty(total), backend));
        };

        // look one past the page in the paging direction
        let lookahead = if page.backwards {
            Page {
                before: Some(first.id.ok_or(MamError::MissingIdentifier)?),
                limit: 1,
                ..page
            }
        } else {
            Page {
                after: Some(last.id.ok_or(MamError::MissingIdentifier)?),
                limit: 1,
                ..page
            }
        };
        let complete = query.page(&lookahead).await?.is_empty();

        let by = scope.archive_jid();
        let use_stable_ids = request.use_stable_ids && self.config.query.use_stable_ids;
        let first = StableIdResolver::render(first, by, use_stable_ids)?;
        let last = StableIdResolver::render(last, by, use_stable_ids)?;

        Ok((
            QueryPage {
                messages,
                total,
                first: Some(first),
                last: Some(last),
                complete,
            },
            backend,
        ))
    }

    async fn resolve(
        &self,
        token: Option<&str>,
        scope: &Scope,
        legacy: bool,
        request: &QueryRequest,
    ) -> Result<Option<i64>, MamError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let id = if legacy {
            self.resolver
                .parse_room_log(token, &request.archive_owner)
                .await?
        } else {
            self.resolver.parse(token, scope).await?
        };
        Ok(Some(id))
    }

    /// First and last message of an archive, `None` when it is empty.
    #[instrument(skip(self))]
    pub async fn metadata(
        &self,
        archive: &BareJid,
        scope: &Scope,
    ) -> Result<Option<ArchiveMetadata>, MamError> {
        let legacy = matches!(scope, Scope::Room { .. }) && self.legacy_rooms();
        let bounds = if legacy {
            self.store.room_log_bounds(archive).await?
        } else {
            self.store.archive_bounds(scope).await?
        };
        let Some(bounds) = bounds else {
            return Ok(None);
        };

        Ok(Some(ArchiveMetadata {
            first_id: self.token_for(bounds.first_id, archive, scope, legacy).await?,
            first_time: bounds.first_time,
            last_id: self.token_for(bounds.last_id, archive, scope, legacy).await?,
            last_time: bounds.last_time,
        }))
    }

    async fn token_for(
        &self,
        id: i64,
        archive: &BareJid,
        scope: &Scope,
        legacy: bool,
    ) -> Result<String, MamError> {
        let record = if legacy {
            self.store.get_room_log_message(id, archive).await?
        } else {
            self.store.get_message(id, scope).await?
        };
        match record {
            Some(record) => StableIdResolver::render(
                &ArchivedMessage::from_record(archive, record),
                archive,
                self.config.query.use_stable_ids,
            ),
            None => Ok(id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::store::LibSqlArchiveStore;
    use crate::types::MessageRecord;

    async fn engine(records: &[MessageRecord]) -> QueryEngine {
        let config = load_config_from_str("[server]\ndomain = \"capulet.lit\"\n").unwrap();
        let store = Arc::new(LibSqlArchiveStore::in_memory().await.unwrap());
        store.insert_messages(records).await.unwrap();
        QueryEngine::new(Arc::new(config), store, None)
    }

    fn record(id: i64, stanza: Option<String>) -> MessageRecord {
        MessageRecord {
            id,
            conversation_id: Some(1),
            from: "juliet@capulet.lit/balcony".parse().unwrap(),
            to: "nurse@capulet.lit".parse().unwrap(),
            sent_date: from_millis(id * 1_000),
            body: Some(format!("line {id}")),
            stanza,
            is_pm_for: None,
            groupchat: false,
        }
    }

    fn juliet() -> BareJid {
        "juliet@capulet.lit".parse().unwrap()
    }

    #[tokio::test]
    async fn test_forward_paging_through_archive() {
        let engine = engine(&(1..=5).map(|id| record(id, None)).collect::<Vec<_>>()).await;

        let mut request = QueryRequest::personal(juliet());
        request.max = Some(2);
        let first = engine.find_messages(&request).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.first.as_deref(), Some("1"));
        assert_eq!(first.last.as_deref(), Some("2"));
        assert!(!first.complete);

        request.after = first.last.clone();
        request.max = Some(3);
        let rest = engine.find_messages(&request).await.unwrap();
        assert_eq!(rest.first.as_deref(), Some("3"));
        assert_eq!(rest.last.as_deref(), Some("5"));
        assert!(rest.complete);
    }

    #[tokio::test]
    async fn test_last_page_when_paging_backwards() {
        let engine = engine(&(1..=5).map(|id| record(id, None)).collect::<Vec<_>>()).await;

        let mut request = QueryRequest::personal(juliet());
        request.max = Some(2);
        request.backwards = true;
        let page = engine.find_messages(&request).await.unwrap();
        let ids: Vec<i64> = page.messages.iter().filter_map(|m| m.id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert!(!page.complete);
    }

    #[tokio::test]
    async fn test_stable_ids_become_cursors() {
        let stanza = "<message xmlns='jabber:client'>\
            <stanza-id xmlns='urn:xmpp:sid:0' by='juliet@capulet.lit' id='a-1'/>\
            <body>line 1</body></message>"
            .to_string();
        let engine = engine(&[record(1, Some(stanza)), record(2, None)]).await;

        let mut request = QueryRequest::personal(juliet());
        request.max = Some(1);
        let page = engine.find_messages(&request).await.unwrap();
        assert_eq!(page.first.as_deref(), Some("a-1"));

        request.after = Some("a-1".to_string());
        let next = engine.find_messages(&request).await.unwrap();
        assert_eq!(next.first.as_deref(), Some("2"));
        assert!(next.complete);
    }

    #[tokio::test]
    async fn test_single_anchor_honored_when_both_given() {
        let engine = engine(&(1..=5).map(|id| record(id, None)).collect::<Vec<_>>()).await;

        let mut request = QueryRequest::personal(juliet());
        request.max = Some(10);
        request.after = Some("1".to_string());
        request.before = Some("4".to_string());
        let forward = engine.find_messages(&request).await.unwrap();
        let ids: Vec<i64> = forward.messages.iter().filter_map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
        assert!(forward.complete);

        request.backwards = true;
        let backward = engine.find_messages(&request).await.unwrap();
        let ids: Vec<i64> = backward.messages.iter().filter_map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_cursor_is_not_found() {
        let engine = engine(&[record(1, None)]).await;
        let mut request = QueryRequest::personal(juliet());
        request.after = Some("999".to_string());
        let err = engine.find_messages(&request).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_text_query_without_index_is_rejected() {
        let engine = engine(&[record(1, None)]).await;
        let mut request = QueryRequest::personal(juliet());
        request.text = Some("line".to_string());
        let err = engine.find_messages(&request).await.unwrap_err();
        assert!(matches!(err, MamError::Stanza { .. }));
    }

    #[tokio::test]
    async fn test_metadata_bounds() {
        let engine = engine(&(1..=3).map(|id| record(id, None)).collect::<Vec<_>>()).await;
        let scope = Scope::Personal { owner: juliet() };
        let metadata = engine.metadata(&juliet(), &scope).await.unwrap().unwrap();
        assert_eq!(metadata.first_id, "1");
        assert_eq!(metadata.last_id, "3");
        assert_eq!(metadata.last_time, from_millis(3_000));

        let empty = Scope::Personal {
            owner: "romeo@montague.lit".parse().unwrap(),
        };
        let romeo: BareJid = "romeo@montague.lit".parse().unwrap();
        assert!(engine.metadata(&romeo, &empty).await.unwrap().is_none());
    }
}
