//! libSQL implementation of the archive store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use libsql::{Connection, Row, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::schema::MigrationRunner;
use super::sql::{MessageFilter, Page, RoomLogFilter, Scope, SqlDialect, MESSAGE_COLUMNS, ROOM_LOG_COLUMNS};
use super::{
    ArchiveBounds, ArchiveStore, ConversationRecord, IndexableMessage, ParticipationRecord,
    ParticipationUpdate, RoomLogRecord, StoreError,
};
use crate::types::{from_millis, join_jid, split_jid, to_millis, MessageRecord};

/// Stored in place of a missing resource so that participant rows can be
/// matched by equality.
const NO_RESOURCE: &str = " ";

/// libSQL-based archive store.
///
/// Works on a local file or an in-memory database. All access goes through one
/// shared connection.
#[derive(Clone)]
pub struct LibSqlArchiveStore {
    /// Database connection.
    /// For in-memory databases, this must be a persistent connection.
    conn: Arc<Mutex<Connection>>,
    /// Whether the schema has been initialized.
    initialized: Arc<AtomicBool>,
}

impl LibSqlArchiveStore {
    pub fn new(conn: Connection) -> Self {
        Self::from_shared(Arc::new(Mutex::new(conn)))
    }

    /// Create from an Arc<Mutex<Connection>> (for sharing with other components).
    pub fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open an in-memory archive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let store = Self::new(db.connect()?);
        store.initialize().await?;
        Ok(store)
    }

    /// Open (or create) a file-backed archive.
    pub async fn open_local(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("Failed to create database directory: {}", e))
            })?;
        }
        let db = libsql::Builder::new_local(path).build().await?;
        let store = Self::new(db.connect()?);
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize the database schema if not already done.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        MigrationRunner::default().run(&conn).await?;

        self.initialized.store(true, Ordering::Release);
        debug!("Archive schema initialized");

        Ok(())
    }

    async fn query_records(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        debug!(sql = %sql, "Executing archive query");
        let mut rows = conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(message_from_row(&row)?);
        }
        Ok(records)
    }

    async fn query_room_log(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        debug!(sql = %sql, "Executing room log query");
        let mut rows = conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(room_log_from_row(&row)?);
        }
        Ok(records)
    }

    async fn query_count(&self, sql: &str, params: Vec<Value>) -> Result<i64, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        let mut rows = conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<i64>>(0)?.unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn query_candidates(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<(i64, String)>, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        let mut rows = conn.query(sql, params).await?;
        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await? {
            candidates.push((row.get(0)?, row.get(1)?));
        }
        Ok(candidates)
    }

    async fn query_edge(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Option<(i64, DateTime<Utc>)>, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        let mut rows = conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some((row.get(0)?, from_millis(row.get(1)?)))),
            None => Ok(None),
        }
    }
}

/// A filter spanning the whole archive addressed by `scope`.
fn unbounded(scope: &Scope) -> MessageFilter {
    MessageFilter {
        scope: scope.clone(),
        with: None,
        start: from_millis(0),
        end: DateTime::<Utc>::MAX_UTC,
    }
}

fn text_or_null(value: Option<&str>) -> Value {
    match value {
        Some(v) => Value::Text(v.to_string()),
        None => Value::Null,
    }
}

fn message_from_row(row: &Row) -> Result<MessageRecord, StoreError> {
    let from_jid: String = row.get(2)?;
    let from_resource: Option<String> = row.get(3)?;
    let to_jid: String = row.get(4)?;
    let to_resource: Option<String> = row.get(5)?;
    let is_pm_for: Option<String> = row.get(9)?;
    let message_type: String = row.get(10)?;

    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        from: join_jid(&from_jid, from_resource.as_deref())?,
        to: join_jid(&to_jid, to_resource.as_deref())?,
        sent_date: from_millis(row.get(6)?),
        body: row.get(7)?,
        stanza: row.get(8)?,
        is_pm_for: is_pm_for.map(|j| BareJid::new(&j)).transpose()?,
        groupchat: message_type == "groupchat",
    })
}

/// Room log rows take the shape of archived room messages: sent by the
/// occupant's real JID to the occupant's room JID.
fn room_log_from_row(row: &Row) -> Result<MessageRecord, StoreError> {
    let sender: String = row.get(1)?;
    let nickname: Option<String> = row.get(2)?;
    let room: String = row.get(7)?;
    let room_jid = BareJid::new(&room)?;
    let to = match nickname.as_deref() {
        Some(nick) => Jid::from(room_jid.with_resource_str(nick)?),
        None => Jid::from(room_jid),
    };

    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: None,
        from: sender.parse()?,
        to,
        sent_date: from_millis(row.get(3)?),
        body: row.get(5)?,
        stanza: row.get(6)?,
        is_pm_for: None,
        groupchat: true,
    })
}

#[async_trait]
impl ArchiveStore for LibSqlArchiveStore {
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn insert_messages(&self, messages: &[MessageRecord]) -> Result<(), StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await?;

        let mut seq = {
            let mut rows = tx
                .query("SELECT COALESCE(MAX(stored_seq), 0) FROM mam_message", ())
                .await?;
            match rows.next().await? {
                Some(row) => row.get::<i64>(0)?,
                None => 0,
            }
        };

        for message in messages {
            seq += 1;
            let (from_jid, from_resource) = split_jid(&message.from);
            let (to_jid, to_resource) = split_jid(&message.to);
            let params: Vec<Value> = vec![
                message.id.into(),
                message.conversation_id.map_or(Value::Null, Value::Integer),
                from_jid.into(),
                text_or_null(from_resource.as_deref()),
                to_jid.into(),
                text_or_null(to_resource.as_deref()),
                to_millis(message.sent_date).into(),
                text_or_null(message.body.as_deref()),
                text_or_null(message.stanza.as_deref()),
                message
                    .is_pm_for
                    .as_ref()
                    .map_or(Value::Null, |j| Value::Text(j.to_string())),
                (if message.groupchat { "groupchat" } else { "chat" }).into(),
                seq.into(),
            ];
            tx.execute(
                r#"
                INSERT INTO mam_message (
                    id, conversation_id, from_jid, from_resource, to_jid, to_resource,
                    sent_date, body, stanza, is_pm_for_jid, message_type, stored_seq
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params,
            )
            .await?;
        }

        tx.commit().await?;
        debug!("Messages stored in archive");
        Ok(())
    }

    #[instrument(skip(self, conversations), fields(count = conversations.len()))]
    async fn upsert_conversations(
        &self,
        conversations: &[ConversationRecord],
    ) -> Result<(), StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await?;

        for conversation in conversations {
            let params: Vec<Value> = vec![
                conversation.id.into(),
                conversation
                    .room
                    .as_ref()
                    .map_or(Value::Null, |r| Value::Text(r.to_string())),
                i64::from(conversation.external).into(),
                to_millis(conversation.start_date).into(),
                to_millis(conversation.last_activity).into(),
                conversation.message_count.into(),
            ];
            tx.execute(
                r#"
                INSERT INTO mam_conversation (
                    conversation_id, room, is_external, start_date, last_activity, message_count
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(conversation_id) DO UPDATE SET
                    last_activity = MAX(last_activity, excluded.last_activity),
                    message_count = MAX(message_count, excluded.message_count)
                "#,
                params,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, updates), fields(count = updates.len()))]
    async fn store_participations(
        &self,
        updates: &[ParticipationUpdate],
    ) -> Result<(), StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await?;

        for update in updates {
            match update {
                ParticipationUpdate::Joined(record) => {
                    let (bare, resource) = split_jid(&record.jid);
                    let params: Vec<Value> = vec![
                        record.conversation_id.into(),
                        to_millis(record.joined).into(),
                        record
                            .left
                            .map_or(Value::Null, |left| Value::Integer(to_millis(left))),
                        bare.into(),
                        resource.unwrap_or_else(|| NO_RESOURCE.to_string()).into(),
                        text_or_null(record.nickname.as_deref()),
                    ];
                    tx.execute(
                        r#"
                        INSERT INTO mam_participant (
                            conversation_id, joined_date, left_date, bare_jid, jid_resource, nickname
                        )
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        "#,
                        params,
                    )
                    .await?;
                }
                ParticipationUpdate::Left {
                    conversation_id,
                    jid,
                    joined,
                    left,
                } => {
                    let (bare, resource) = split_jid(jid);
                    let params: Vec<Value> = vec![
                        to_millis(*left).into(),
                        (*conversation_id).into(),
                        bare.into(),
                        resource.unwrap_or_else(|| NO_RESOURCE.to_string()).into(),
                        to_millis(*joined).into(),
                    ];
                    tx.execute(
                        r#"
                        UPDATE mam_participant SET left_date = ?1
                        WHERE conversation_id = ?2 AND bare_jid = ?3
                          AND jid_resource = ?4 AND joined_date = ?5
                        "#,
                        params,
                    )
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn insert_room_log(&self, rows: &[RoomLogRecord]) -> Result<(), StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await?;

        for row in rows {
            let params: Vec<Value> = vec![
                row.room.to_string().into(),
                row.message_id.into(),
                row.sender.to_string().into(),
                text_or_null(row.nickname.as_deref()),
                to_millis(row.log_time).into(),
                text_or_null(row.subject.as_deref()),
                text_or_null(row.body.as_deref()),
                text_or_null(row.stanza.as_deref()),
            ];
            tx.execute(
                r#"
                INSERT INTO muc_conversation_log (
                    room_jid, message_id, sender, nickname, log_time, subject, body, stanza
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(archive = %filter.scope.archive_jid()))]
    async fn fetch_messages(
        &self,
        filter: &MessageFilter,
        page: &Page,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let (sql, params) = filter.select(SqlDialect::Sqlite, page);
        self.query_records(&sql, params).await
    }

    #[instrument(skip(self, filter), fields(archive = %filter.scope.archive_jid()))]
    async fn count_messages(&self, filter: &MessageFilter) -> Result<i64, StoreError> {
        let (sql, params) = filter.count();
        self.query_count(&sql, params).await
    }

    #[instrument(skip(self, filter), fields(room = %filter.room))]
    async fn fetch_room_log(
        &self,
        filter: &RoomLogFilter,
        page: &Page,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let (sql, params) = filter.select(SqlDialect::Sqlite, page);
        self.query_room_log(&sql, params).await
    }

    #[instrument(skip(self, filter), fields(room = %filter.room))]
    async fn count_room_log(&self, filter: &RoomLogFilter) -> Result<i64, StoreError> {
        let (sql, params) = filter.count();
        self.query_count(&sql, params).await
    }

    async fn get_message(
        &self,
        id: i64,
        scope: &Scope,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let (where_clause, mut params) = unbounded(scope).where_clause(None);
        params.push(id.into());
        let sql = format!(
            "SELECT {} FROM mam_message WHERE {} AND id = ?",
            MESSAGE_COLUMNS, where_clause
        );
        Ok(self.query_records(&sql, params).await?.into_iter().next())
    }

    async fn get_room_log_message(
        &self,
        id: i64,
        room: &BareJid,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let sql = format!(
            "SELECT {ROOM_LOG_COLUMNS} FROM muc_conversation_log WHERE room_jid = ?1 AND message_id = ?2"
        );
        let params: Vec<Value> = vec![room.to_string().into(), id.into()];
        Ok(self.query_room_log(&sql, params).await?.into_iter().next())
    }

    #[instrument(skip(self, scope), fields(archive = %scope.archive_jid()))]
    async fn stable_id_candidates(
        &self,
        scope: &Scope,
        token: &str,
    ) -> Result<Vec<(i64, String)>, StoreError> {
        let (where_clause, mut params) = unbounded(scope).where_clause(None);
        params.push(token.into());
        let sql = format!(
            "SELECT id, stanza FROM mam_message WHERE {where_clause} \
             AND stanza IS NOT NULL AND instr(stanza, ?) > 0 \
             AND instr(stanza, 'urn:xmpp:sid:') > 0 ORDER BY id"
        );
        self.query_candidates(&sql, params).await
    }

    async fn room_log_stable_id_candidates(
        &self,
        room: &BareJid,
        token: &str,
    ) -> Result<Vec<(i64, String)>, StoreError> {
        let params: Vec<Value> = vec![room.to_string().into(), token.into()];
        self.query_candidates(
            "SELECT message_id, stanza FROM muc_conversation_log \
             WHERE room_jid = ?1 AND message_id IS NOT NULL AND stanza IS NOT NULL \
             AND instr(stanza, ?2) > 0 AND instr(stanza, 'urn:xmpp:sid:') > 0 \
             ORDER BY message_id",
            params,
        )
        .await
    }

    #[instrument(skip(self, scope), fields(archive = %scope.archive_jid()))]
    async fn archive_bounds(&self, scope: &Scope) -> Result<Option<ArchiveBounds>, StoreError> {
        let (where_clause, params) = unbounded(scope).where_clause(None);
        let first = self
            .query_edge(
                &SqlDialect::Sqlite.select_page(
                    "id, sent_date",
                    "mam_message",
                    &where_clause,
                    "sent_date ASC, id ASC",
                    1,
                ),
                params.clone(),
            )
            .await?;
        let last = self
            .query_edge(
                &SqlDialect::Sqlite.select_page(
                    "id, sent_date",
                    "mam_message",
                    &where_clause,
                    "sent_date DESC, id DESC",
                    1,
                ),
                params,
            )
            .await?;

        Ok(match (first, last) {
            (Some((first_id, first_time)), Some((last_id, last_time))) => Some(ArchiveBounds {
                first_id,
                first_time,
                last_id,
                last_time,
            }),
            _ => None,
        })
    }

    async fn room_log_bounds(&self, room: &BareJid) -> Result<Option<ArchiveBounds>, StoreError> {
        let filter = RoomLogFilter {
            room: room.clone(),
            with: None,
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        };
        let (where_clause, params) = filter.where_clause(None);
        let first = self
            .query_edge(
                &SqlDialect::Sqlite.select_page(
                    "message_id, log_time",
                    "muc_conversation_log",
                    &where_clause,
                    "log_time ASC, message_id ASC",
                    1,
                ),
                params.clone(),
            )
            .await?;
        let last = self
            .query_edge(
                &SqlDialect::Sqlite.select_page(
                    "message_id, log_time",
                    "muc_conversation_log",
                    &where_clause,
                    "log_time DESC, message_id DESC",
                    1,
                ),
                params,
            )
            .await?;

        Ok(first.zip(last).map(|((first_id, first_time), (last_id, last_time))| {
            ArchiveBounds {
                first_id,
                first_time,
                last_id,
                last_time,
            }
        }))
    }

    async fn messages_for_index(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<IndexableMessage>, StoreError> {
        self.initialize().await?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}, stored_seq FROM mam_message \
             WHERE stored_seq > ?1 AND body IS NOT NULL ORDER BY stored_seq ASC LIMIT {limit}"
        );
        let conn = self.conn.lock().await;
        let mut rows = conn.query(&sql, vec![Value::from(after_seq)]).await?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            let record = message_from_row(&row)?;
            let room = record.groupchat.then(|| record.to.to_bare());
            messages.push(IndexableMessage {
                stored_seq: row.get(11)?,
                record,
                room,
            });
        }
        Ok(messages)
    }

    async fn count_for_index(&self, after_seq: i64) -> Result<i64, StoreError> {
        self.query_count(
            "SELECT COUNT(*) FROM mam_message WHERE stored_seq > ?1 AND body IS NOT NULL",
            vec![after_seq.into()],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await?;
        let cutoff = to_millis(cutoff);

        const EXPIRED: &str = "(conversation_id IN \
             (SELECT conversation_id FROM mam_conversation WHERE last_activity < ?1) \
             OR (conversation_id IS NULL AND sent_date < ?1))";

        let mut ids = Vec::new();
        {
            let mut rows = tx
                .query(
                    &format!("SELECT id FROM mam_message WHERE {EXPIRED}"),
                    libsql::params![cutoff],
                )
                .await?;
            while let Some(row) = rows.next().await? {
                ids.push(row.get::<i64>(0)?);
            }
        }
        tx.execute(
            &format!("DELETE FROM mam_message WHERE {EXPIRED}"),
            libsql::params![cutoff],
        )
        .await?;
        tx.execute(
            "DELETE FROM mam_participant WHERE conversation_id IN \
             (SELECT conversation_id FROM mam_conversation WHERE last_activity < ?1)",
            libsql::params![cutoff],
        )
        .await?;
        tx.execute(
            "DELETE FROM mam_conversation WHERE last_activity < ?1",
            libsql::params![cutoff],
        )
        .await?;

        tx.commit().await?;
        debug!(deleted = ids.len(), "Purged expired conversations");
        Ok(ids)
    }

    async fn max_message_id(&self) -> Result<i64, StoreError> {
        let archive = self
            .query_count("SELECT MAX(id) FROM mam_message", Vec::new())
            .await?;
        let room_log = self
            .query_count("SELECT MAX(message_id) FROM muc_conversation_log", Vec::new())
            .await?;
        Ok(archive.max(room_log))
    }

    async fn max_conversation_id(&self) -> Result<i64, StoreError> {
        self.query_count("SELECT MAX(conversation_id) FROM mam_conversation", Vec::new())
            .await
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<ConversationRecord>, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        let mut rows = conn
            .query(
                "SELECT conversation_id, room, is_external, start_date, last_activity, message_count \
                 FROM mam_conversation WHERE conversation_id = ?1",
                libsql::params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let room: Option<String> = row.get(1)?;
                let external: i64 = row.get(2)?;
                Ok(Some(ConversationRecord {
                    id: row.get(0)?,
                    room: room.map(|r| BareJid::new(&r)).transpose()?,
                    external: external != 0,
                    start_date: from_millis(row.get(3)?),
                    last_activity: from_millis(row.get(4)?),
                    message_count: row.get(5)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn participations(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ParticipationRecord>, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        let mut rows = conn
            .query(
                "SELECT conversation_id, joined_date, left_date, bare_jid, jid_resource, nickname \
                 FROM mam_participant WHERE conversation_id = ?1 ORDER BY joined_date, bare_jid",
                libsql::params![conversation_id],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let bare: String = row.get(3)?;
            let resource: String = row.get(4)?;
            let left: Option<i64> = row.get(2)?;
            records.push(ParticipationRecord {
                conversation_id: row.get(0)?,
                jid: join_jid(&bare, Some(resource.as_str()))?,
                nickname: row.get(5)?,
                joined: from_millis(row.get(1)?),
                left: left.map(from_millis),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn message(id: i64, from: &str, to: &str, at: i64) -> MessageRecord {
        MessageRecord {
            id,
            conversation_id: Some(1),
            from: jid(from),
            to: jid(to),
            sent_date: from_millis(at),
            body: Some(format!("message {id}")),
            stanza: None,
            is_pm_for: None,
            groupchat: false,
        }
    }

    fn personal(owner: &str) -> Scope {
        Scope::Personal {
            owner: owner.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch_messages() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        store
            .insert_messages(&[
                message(1, "juliet@capulet.lit/balcony", "romeo@montague.lit", 1_000),
                message(2, "romeo@montague.lit/orchard", "juliet@capulet.lit", 2_000),
                message(3, "nurse@capulet.lit", "tybalt@capulet.lit", 3_000),
            ])
            .await
            .unwrap();

        let filter = MessageFilter {
            scope: personal("juliet@capulet.lit"),
            with: None,
            start: from_millis(0),
            end: from_millis(10_000),
        };

        let forward = store.fetch_messages(&filter, &Page::forward(10)).await.unwrap();
        assert_eq!(forward.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(forward[0].from.to_string(), "juliet@capulet.lit/balcony");

        let backward = store.fetch_messages(&filter, &Page::backward(1)).await.unwrap();
        assert_eq!(backward[0].id, 2);

        assert_eq!(store.count_messages(&filter).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_message_is_scoped_to_archive() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        store
            .insert_messages(&[message(5, "juliet@capulet.lit", "romeo@montague.lit", 1)])
            .await
            .unwrap();

        assert!(store
            .get_message(5, &personal("romeo@montague.lit"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_message(5, &personal("tybalt@capulet.lit"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_participation_lifecycle() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        let juliet = jid("juliet@capulet.lit");

        store
            .store_participations(&[ParticipationUpdate::Joined(ParticipationRecord {
                conversation_id: 9,
                jid: juliet.clone(),
                nickname: None,
                joined: from_millis(100),
                left: None,
            })])
            .await
            .unwrap();
        store
            .store_participations(&[ParticipationUpdate::Left {
                conversation_id: 9,
                jid: juliet.clone(),
                joined: from_millis(100),
                left: from_millis(500),
            }])
            .await
            .unwrap();

        let records = store.participations(9).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].jid, juliet);
        assert_eq!(records[0].left, Some(from_millis(500)));
    }

    #[tokio::test]
    async fn test_conversation_upsert_updates_activity() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        let mut record = ConversationRecord {
            id: 1,
            room: None,
            external: true,
            start_date: from_millis(0),
            last_activity: from_millis(10),
            message_count: 1,
        };
        store.upsert_conversations(&[record.clone()]).await.unwrap();

        record.last_activity = from_millis(20);
        record.message_count = 2;
        store.upsert_conversations(&[record.clone()]).await.unwrap();

        assert_eq!(store.get_conversation(1).await.unwrap(), Some(record));
        assert_eq!(store.max_conversation_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_conversation_row_does_not_rewind_activity() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        let created = ConversationRecord {
            id: 1,
            room: None,
            external: false,
            start_date: from_millis(0),
            last_activity: from_millis(0),
            message_count: 1,
        };
        let updated = ConversationRecord {
            last_activity: from_millis(30),
            message_count: 3,
            ..created.clone()
        };

        // the update batch flushed before the insert batch
        store.upsert_conversations(&[updated.clone()]).await.unwrap();
        store.upsert_conversations(&[created]).await.unwrap();

        assert_eq!(store.get_conversation(1).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_purge_keeps_messages_of_active_conversations() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        for (id, last_activity) in [(1, 50), (2, 500)] {
            store
                .upsert_conversations(&[ConversationRecord {
                    id,
                    room: None,
                    external: false,
                    start_date: from_millis(0),
                    last_activity: from_millis(last_activity),
                    message_count: 1,
                }])
                .await
                .unwrap();
        }
        let mut old = message(1, "juliet@capulet.lit", "nurse@capulet.lit", 50);
        old.conversation_id = Some(1);
        // sent before the cutoff, but its conversation is still active
        let mut kept = message(2, "juliet@capulet.lit", "romeo@montague.lit", 40);
        kept.conversation_id = Some(2);
        let mut loose = message(3, "juliet@capulet.lit", "nurse@capulet.lit", 60);
        loose.conversation_id = None;
        store.insert_messages(&[old, kept, loose]).await.unwrap();

        let mut deleted = store.purge_older_than(from_millis(100)).await.unwrap();
        deleted.sort_unstable();
        assert_eq!(deleted, vec![1, 3]);
        assert_eq!(store.max_message_id().await.unwrap(), 2);
        assert!(store.get_conversation(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_removes_expired_conversations() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        store
            .upsert_conversations(&[ConversationRecord {
                id: 1,
                room: None,
                external: false,
                start_date: from_millis(0),
                last_activity: from_millis(50),
                message_count: 1,
            }])
            .await
            .unwrap();
        store
            .insert_messages(&[message(1, "juliet@capulet.lit", "romeo@montague.lit", 50)])
            .await
            .unwrap();

        let deleted = store.purge_older_than(from_millis(100)).await.unwrap();
        assert_eq!(deleted, vec![1]);
        assert!(store.get_conversation(1).await.unwrap().is_none());
        assert_eq!(store.max_message_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stable_id_candidates_match_stanza_text() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        let mut with_sid = message(1, "romeo@montague.lit", "juliet@capulet.lit", 1);
        with_sid.stanza = Some(
            "<message xmlns='jabber:client'><body>hi</body>\
             <stanza-id xmlns='urn:xmpp:sid:0' by='juliet@capulet.lit' id='abc-123'/></message>"
                .to_string(),
        );
        store
            .insert_messages(&[with_sid, message(2, "romeo@montague.lit", "juliet@capulet.lit", 2)])
            .await
            .unwrap();

        let candidates = store
            .stable_id_candidates(&personal("juliet@capulet.lit"), "abc-123")
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, 1);
    }

    #[tokio::test]
    async fn test_room_log_rows_use_occupant_jid() {
        let store = LibSqlArchiveStore::in_memory().await.unwrap();
        let room: BareJid = "lobby@conference.capulet.lit".parse().unwrap();
        store
            .insert_room_log(&[RoomLogRecord {
                room: room.clone(),
                message_id: 12,
                sender: jid("nurse@capulet.lit/kitchen"),
                nickname: Some("nurse".to_string()),
                log_time: from_millis(10),
                subject: None,
                body: Some("Juliet!".to_string()),
                stanza: None,
            }])
            .await
            .unwrap();

        let record = store.get_room_log_message(12, &room).await.unwrap().unwrap();
        assert_eq!(record.from.to_string(), "nurse@capulet.lit/kitchen");
        assert_eq!(record.to.to_string(), "lobby@conference.capulet.lit/nurse");
        assert!(record.groupchat);
        assert_eq!(store.max_message_id().await.unwrap(), 12);
    }
}
