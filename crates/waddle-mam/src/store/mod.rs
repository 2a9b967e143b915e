//! Archive store: durable messages, conversations and participations.
//!
//! The store is the only component shared by the write path (archivers) and the
//! read path (paginated queries). Writers hand it whole batches; readers build
//! filters with [`sql::MessageFilter`] / [`sql::RoomLogFilter`].

mod libsql_store;
mod schema;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use thiserror::Error;

use crate::types::MessageRecord;

pub use libsql_store::LibSqlArchiveStore;
pub use schema::{Migration, MigrationRunner};
pub use sql::{MessageFilter, Page, RoomLogFilter, Scope, SqlDialect};

/// Errors that can occur during archive store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid query parameter: {0}")]
    InvalidQuery(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for StoreError {
    fn from(e: libsql::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<jid::Error> for StoreError {
    fn from(e: jid::Error) -> Self {
        StoreError::Serialization(format!("Invalid JID: {}", e))
    }
}

/// Persisted conversation metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: i64,
    /// Room JID for group conversations
    pub room: Option<BareJid>,
    /// Exactly one side of the conversation is outside the local domain
    pub external: bool,
    pub start_date: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: i64,
}

/// A participant's join/leave interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipationRecord {
    pub conversation_id: i64,
    pub jid: Jid,
    pub nickname: Option<String>,
    pub joined: DateTime<Utc>,
    pub left: Option<DateTime<Utc>>,
}

/// Participation changes queued for persistence.
#[derive(Debug, Clone, PartialEq)]
pub enum ParticipationUpdate {
    Joined(ParticipationRecord),
    /// Close the participation identified by conversation, JID and join date
    Left {
        conversation_id: i64,
        jid: Jid,
        joined: DateTime<Utc>,
        left: DateTime<Utc>,
    },
}

/// A row of the host's room conversation log.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomLogRecord {
    pub room: BareJid,
    pub message_id: i64,
    /// Real JID of the occupant
    pub sender: Jid,
    pub nickname: Option<String>,
    pub log_time: DateTime<Utc>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub stanza: Option<String>,
}

/// First and last message of an archive, for metadata queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveBounds {
    pub first_id: i64,
    pub first_time: DateTime<Utc>,
    pub last_id: i64,
    pub last_time: DateTime<Utc>,
}

/// A message handed to the full-text indexer, with its conversation's room.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexableMessage {
    /// Position in store order, the indexer's watermark
    pub stored_seq: i64,
    pub record: MessageRecord,
    pub room: Option<BareJid>,
}

/// Trait for archive storage backends.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Insert archived messages. Ids were assigned on arrival.
    async fn insert_messages(&self, messages: &[MessageRecord]) -> Result<(), StoreError>;

    /// Insert new conversations or refresh the activity of existing ones.
    async fn upsert_conversations(&self, conversations: &[ConversationRecord])
        -> Result<(), StoreError>;

    /// Record participants joining and leaving.
    async fn store_participations(&self, updates: &[ParticipationUpdate]) -> Result<(), StoreError>;

    /// Append rows to the room conversation log.
    async fn insert_room_log(&self, rows: &[RoomLogRecord]) -> Result<(), StoreError>;

    /// Fetch one page of messages. `limit` rows at most, ordered by sent date
    /// ascending, or descending when `backwards` is set.
    async fn fetch_messages(
        &self,
        filter: &MessageFilter,
        page: &Page,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Count distinct messages matching a filter, ignoring cursors.
    async fn count_messages(&self, filter: &MessageFilter) -> Result<i64, StoreError>;

    async fn fetch_room_log(
        &self,
        filter: &RoomLogFilter,
        page: &Page,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    async fn count_room_log(&self, filter: &RoomLogFilter) -> Result<i64, StoreError>;

    /// A single message, if it belongs to the archive addressed by `scope`.
    async fn get_message(&self, id: i64, scope: &Scope) -> Result<Option<MessageRecord>, StoreError>;

    async fn get_room_log_message(
        &self,
        id: i64,
        room: &BareJid,
    ) -> Result<Option<MessageRecord>, StoreError>;

    /// Messages of the archive whose raw stanza mentions `token` and a stanza-id.
    async fn stable_id_candidates(
        &self,
        scope: &Scope,
        token: &str,
    ) -> Result<Vec<(i64, String)>, StoreError>;

    async fn room_log_stable_id_candidates(
        &self,
        room: &BareJid,
        token: &str,
    ) -> Result<Vec<(i64, String)>, StoreError>;

    /// First and last message of an archive, `None` when it is empty.
    async fn archive_bounds(&self, scope: &Scope) -> Result<Option<ArchiveBounds>, StoreError>;

    /// First and last row of a room's conversation log.
    async fn room_log_bounds(&self, room: &BareJid) -> Result<Option<ArchiveBounds>, StoreError>;

    /// Messages with a body stored after position `after_seq`, in store order,
    /// for the full-text indexer.
    async fn messages_for_index(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<IndexableMessage>, StoreError>;

    /// Number of messages the indexer would visit after `after_seq`.
    async fn count_for_index(&self, after_seq: i64) -> Result<i64, StoreError>;

    /// Delete conversations inactive since before `cutoff`, their participants
    /// and messages. Returns the ids of the deleted messages.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>, StoreError>;

    /// Highest message id in use (archive and room log), 0 when empty.
    async fn max_message_id(&self) -> Result<i64, StoreError>;

    async fn max_conversation_id(&self) -> Result<i64, StoreError>;

    async fn get_conversation(&self, id: i64) -> Result<Option<ConversationRecord>, StoreError>;

    async fn participations(&self, conversation_id: i64)
        -> Result<Vec<ParticipationRecord>, StoreError>;
}
