//! Shared fixtures for the archive integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jid::{BareJid, Jid};
use waddle_mam::config::load_config_from_str;
use waddle_mam::store::{
    ArchiveBounds, ArchiveStore, ConversationRecord, IndexableMessage, LibSqlArchiveStore,
    MessageFilter, Page, ParticipationRecord, ParticipationUpdate, RoomLogFilter, RoomLogRecord,
    Scope, StoreError,
};
use waddle_mam::{ArchiveConfig, MessageRecord};

pub const DOMAIN: &str = "capulet.lit";

/// Route archive logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parse a configuration body appended to the test domain.
pub fn config(extra: &str) -> ArchiveConfig {
    load_config_from_str(&format!("[server]\ndomain = \"{DOMAIN}\"\n{extra}"))
        .expect("test configuration is valid")
}

pub fn jid(s: &str) -> Jid {
    s.parse().expect("valid JID")
}

pub fn bare(s: &str) -> BareJid {
    s.parse().expect("valid bare JID")
}

/// A fixed instant to build timelines from.
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn minutes(n: i64) -> Duration {
    Duration::minutes(n)
}

/// A one-to-one message row sent `offset_secs` after [`t0`].
pub fn chat(id: i64, from: &str, to: &str, offset_secs: i64) -> MessageRecord {
    MessageRecord {
        id,
        conversation_id: Some(1),
        from: jid(from),
        to: jid(to),
        sent_date: t0() + Duration::seconds(offset_secs),
        body: Some(format!("message {id}")),
        stanza: None,
        is_pm_for: None,
        groupchat: false,
    }
}

/// An archive store that counts read calls.
pub struct CountingStore {
    inner: LibSqlArchiveStore,
    fetches: AtomicUsize,
    counts: AtomicUsize,
}

impl CountingStore {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LibSqlArchiveStore::in_memory()
                .await
                .expect("in-memory store opens"),
            fetches: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> usize {
        self.counts.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.fetches() + self.counts()
    }
}

#[async_trait]
impl ArchiveStore for CountingStore {
    async fn insert_messages(&self, messages: &[MessageRecord]) -> Result<(), StoreError> {
        self.inner.insert_messages(messages).await
    }

    async fn upsert_conversations(
        &self,
        conversations: &[ConversationRecord],
    ) -> Result<(), StoreError> {
        self.inner.upsert_conversations(conversations).await
    }

    async fn store_participations(&self, updates: &[ParticipationUpdate]) -> Result<(), StoreError> {
        self.inner.store_participations(updates).await
    }

    async fn insert_room_log(&self, rows: &[RoomLogRecord]) -> Result<(), StoreError> {
        self.inner.insert_room_log(rows).await
    }

    async fn fetch_messages(
        &self,
        filter: &MessageFilter,
        page: &Page,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_messages(filter, page).await
    }

    async fn count_messages(&self, filter: &MessageFilter) -> Result<i64, StoreError> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        self.inner.count_messages(filter).await
    }

    async fn fetch_room_log(
        &self,
        filter: &RoomLogFilter,
        page: &Page,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_room_log(filter, page).await
    }

    async fn count_room_log(&self, filter: &RoomLogFilter) -> Result<i64, StoreError> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        self.inner.count_room_log(filter).await
    }

    async fn get_message(&self, id: i64, scope: &Scope) -> Result<Option<MessageRecord>, StoreError> {
        self.inner.get_message(id, scope).await
    }

    async fn get_room_log_message(
        &self,
        id: i64,
        room: &BareJid,
    ) -> Result<Option<MessageRecord>, StoreError> {
        self.inner.get_room_log_message(id, room).await
    }

    async fn stable_id_candidates(
        &self,
        scope: &Scope,
        token: &str,
    ) -> Result<Vec<(i64, String)>, StoreError> {
        self.inner.stable_id_candidates(scope, token).await
    }

    async fn room_log_stable_id_candidates(
        &self,
        room: &BareJid,
        token: &str,
    ) -> Result<Vec<(i64, String)>, StoreError> {
        self.inner.room_log_stable_id_candidates(room, token).await
    }

    async fn archive_bounds(&self, scope: &Scope) -> Result<Option<ArchiveBounds>, StoreError> {
        self.inner.archive_bounds(scope).await
    }

    async fn room_log_bounds(&self, room: &BareJid) -> Result<Option<ArchiveBounds>, StoreError> {
        self.inner.room_log_bounds(room).await
    }

    async fn messages_for_index(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<IndexableMessage>, StoreError> {
        self.inner.messages_for_index(after_seq, limit).await
    }

    async fn count_for_index(&self, after_seq: i64) -> Result<i64, StoreError> {
        self.inner.count_for_index(after_seq).await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        self.inner.purge_older_than(cutoff).await
    }

    async fn max_message_id(&self) -> Result<i64, StoreError> {
        self.inner.max_message_id().await
    }

    async fn max_conversation_id(&self) -> Result<i64, StoreError> {
        self.inner.max_conversation_id().await
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<ConversationRecord>, StoreError> {
        self.inner.get_conversation(id).await
    }

    async fn participations(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ParticipationRecord>, StoreError> {
        self.inner.participations(conversation_id).await
    }
}
