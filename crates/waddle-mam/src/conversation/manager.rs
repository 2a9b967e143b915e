//! Active conversation tracking and the archive write path.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, Jid};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{
    Conversation, ConversationKey, ConversationListener, MessageEvent, RoomMessageEvent,
};
use crate::archiver::{Archiver, ArchiveWriter, ArchiverSettings, EtaSource, RoomArchivers};
use crate::config::{ArchiveConfig, RoomBackend};
use crate::error::MamError;
use crate::metrics;
use crate::sequence::IdSequence;
use crate::store::{ArchiveStore, ConversationRecord, ParticipationUpdate, RoomLogRecord};
use crate::types::{EmptyMessageKind, MessageRecord};

const LOCK_STRIPES: usize = 64;

/// The archivers fed by the windowing engine.
pub struct WritePath {
    pub conversations: Arc<Archiver<ConversationRecord>>,
    pub conversation_updates: Arc<Archiver<ConversationRecord>>,
    pub participations: Arc<Archiver<ParticipationUpdate>>,
    pub messages: Arc<Archiver<MessageRecord>>,
    pub room_logs: Arc<RoomArchivers>,
}

impl WritePath {
    pub fn new(store: Arc<dyn ArchiveStore>, settings: ArchiverSettings) -> Self {
        let writer = Arc::new(ArchiveWriter::new(store));
        Self {
            conversations: Arc::new(Archiver::<ConversationRecord>::new(
                "conversations",
                settings,
                writer.clone(),
            )),
            conversation_updates: Arc::new(Archiver::<ConversationRecord>::new(
                "conversation-updates",
                settings,
                writer.clone(),
            )),
            participations: Arc::new(Archiver::<ParticipationUpdate>::new(
                "participations",
                settings,
                writer.clone(),
            )),
            messages: Arc::new(Archiver::<MessageRecord>::new(
                "messages",
                settings,
                writer.clone(),
            )),
            room_logs: Arc::new(RoomArchivers::new(settings, writer)),
        }
    }

    /// Everything the availability gate has to wait for.
    pub fn eta_sources(&self) -> Vec<Arc<dyn EtaSource>> {
        vec![
            self.conversations.clone() as Arc<dyn EtaSource>,
            self.conversation_updates.clone() as Arc<dyn EtaSource>,
            self.participations.clone() as Arc<dyn EtaSource>,
            self.messages.clone() as Arc<dyn EtaSource>,
            self.room_logs.clone() as Arc<dyn EtaSource>,
        ]
    }

    pub fn spawn(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.room_logs.start(token);
        vec![
            self.conversations.spawn(token.child_token()),
            self.conversation_updates.spawn(token.child_token()),
            self.participations.spawn(token.child_token()),
            self.messages.spawn(token.child_token()),
        ]
    }

    /// Drain every queue, conversations before the rows that reference them.
    pub async fn flush_all(&self) -> usize {
        self.conversations.flush_now().await
            + self.conversation_updates.flush_now().await
            + self.participations.flush_now().await
            + self.messages.flush_now().await
            + self.room_logs.flush_all().await
    }
}

enum Notice {
    Created(Conversation),
    Updated(Conversation, DateTime<Utc>),
    Ended(Conversation),
}

/// Owns the active conversations and classifies incoming traffic into them.
///
/// Decisions for one conversation key are serialized by a striped lock;
/// different keys proceed in parallel.
pub struct ConversationManager {
    config: Arc<ArchiveConfig>,
    store: Arc<dyn ArchiveStore>,
    write: Arc<WritePath>,
    message_ids: Arc<IdSequence>,
    conversation_ids: IdSequence,
    conversations: DashMap<ConversationKey, Conversation>,
    stripes: Vec<Mutex<()>>,
    listeners: RwLock<Vec<Arc<dyn ConversationListener>>>,
}

impl ConversationManager {
    pub fn new(
        config: Arc<ArchiveConfig>,
        store: Arc<dyn ArchiveStore>,
        write: Arc<WritePath>,
        message_ids: Arc<IdSequence>,
        conversation_ids: IdSequence,
    ) -> Self {
        Self {
            config,
            store,
            write,
            message_ids,
            conversation_ids,
            conversations: DashMap::new(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Build a manager whose id sequences continue after what the store holds.
    pub async fn load(
        config: Arc<ArchiveConfig>,
        store: Arc<dyn ArchiveStore>,
        write: Arc<WritePath>,
    ) -> Result<Self, MamError> {
        let message_ids = Arc::new(IdSequence::starting_after(store.max_message_id().await?));
        let conversation_ids = IdSequence::starting_after(store.max_conversation_id().await?);
        Ok(Self::new(config, store, write, message_ids, conversation_ids))
    }

    pub fn message_ids(&self) -> &Arc<IdSequence> {
        &self.message_ids
    }

    pub fn add_listener(&self, listener: Arc<dyn ConversationListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    fn stripe(&self, key: &ConversationKey) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for notice in &notices {
            match notice {
                Notice::Created(_) => metrics::record_conversation_event("created"),
                Notice::Ended(_) => metrics::record_conversation_event("ended"),
                Notice::Updated(..) => {}
            }
            for listener in &listeners {
                match notice {
                    Notice::Created(c) => listener.conversation_created(c),
                    Notice::Updated(c, at) => listener.conversation_updated(c, *at),
                    Notice::Ended(c) => listener.conversation_ended(c),
                }
            }
        }
        metrics::record_active_conversations(self.conversations.len());
    }

    fn queue_participations(&self, updates: Vec<ParticipationUpdate>) {
        for update in updates {
            self.write.participations.archive(update);
        }
    }

    /// Close a conversation already removed from the active map.
    fn finish(&self, mut conversation: Conversation, notices: &mut Vec<Notice>) {
        debug!(key = %conversation.key, id = ?conversation.id, "Conversation ended");
        let closed = conversation.end();
        self.queue_participations(closed);
        if let Some(record) = conversation.record() {
            self.write.conversation_updates.archive(record);
        }
        notices.push(Notice::Ended(conversation));
    }

    /// Find or start the conversation for `key` and record a message at `at`.
    ///
    /// `create` builds the conversation when none is active, or the active one
    /// went stale.
    fn touch(
        &self,
        key: ConversationKey,
        at: DateTime<Utc>,
        create: impl FnOnce(Option<i64>) -> (Conversation, Vec<ParticipationUpdate>),
    ) -> Option<i64> {
        let idle = self.config.conversation.idle_time();
        let max = self.config.conversation.max_time();
        let mut notices = Vec::new();

        let conversation_id = {
            let _guard = self.stripe(&key);

            let stale = self
                .conversations
                .get(&key)
                .is_some_and(|c| c.is_stale(at, idle, max));
            if stale {
                if let Some((_, old)) = self.conversations.remove(&key) {
                    self.finish(old, &mut notices);
                }
            }

            match self.conversations.get_mut(&key) {
                Some(mut conversation) => {
                    conversation.message_received(at);
                    if let Some(record) = conversation.record() {
                        self.write.conversation_updates.archive(record);
                    }
                    notices.push(Notice::Updated(conversation.clone(), at));
                    conversation.id
                }
                None => {
                    let id = self
                        .config
                        .archiving
                        .metadata_enabled()
                        .then(|| self.conversation_ids.next_id());
                    let (mut conversation, joins) = create(id);
                    conversation.message_received(at);
                    if let Some(record) = conversation.record() {
                        self.write.conversations.archive(record);
                    }
                    self.queue_participations(joins);
                    debug!(key = %key, id = ?id, "Conversation started");
                    notices.push(Notice::Created(conversation.clone()));
                    self.conversations.insert(key, conversation);
                    id
                }
            }
        };

        self.notify(notices);
        conversation_id
    }

    /// Classify a conversation for a one-to-one message without archiving it.
    pub fn classify(&self, from: &Jid, to: &Jid, at: DateTime<Utc>) -> Option<Conversation> {
        let from_local = self.config.server.is_local(from);
        let to_local = self.config.server.is_local(to);
        if !from_local && !to_local {
            debug!(%from, %to, "Ignoring message between remote users");
            return None;
        }

        let external = from_local != to_local;
        let key = ConversationKey::pair(&from.to_bare(), &to.to_bare());
        self.touch(key.clone(), at, |id| {
            let mut conversation = Conversation::start(id, key.clone(), None, external, at);
            let start = conversation.start_date;
            let mut joins = conversation.participant_joined(from, None, start);
            joins.extend(conversation.participant_joined(to, None, start));
            (conversation, joins)
        });
        self.conversation(&key)
    }

    /// Window a one-to-one message and queue it for archiving.
    ///
    /// Returns the archive id assigned to the message, if it is archived.
    #[instrument(skip(self, event), fields(from = %event.from, to = %event.to))]
    pub fn process_message(&self, event: &MessageEvent) -> Option<i64> {
        if event.body.is_none() && !self.archives_empty(event) {
            return None;
        }
        let conversation = self.classify(&event.from, &event.to, event.at)?;

        if !self.config.archiving.messages {
            return None;
        }

        let id = self.message_ids.next_id();
        self.write.messages.archive(MessageRecord {
            id,
            conversation_id: conversation.id,
            from: event.from.clone(),
            to: event.to.clone(),
            sent_date: event.at,
            body: event.body.clone(),
            stanza: event.stanza.clone(),
            is_pm_for: None,
            groupchat: false,
        });
        Some(id)
    }

    /// Whether a body-less message carries a payload configured for archiving.
    fn archives_empty(&self, event: &MessageEvent) -> bool {
        let archiving = &self.config.archiving;
        if archiving.empty_messages.is_empty() {
            return false;
        }
        let Some(stanza) = event.stanza.as_deref() else {
            return false;
        };
        match EmptyMessageKind::classify(stanza) {
            Some(kind) if archiving.archives_empty(kind) => true,
            kind => {
                debug!(?kind, "Skipping empty message");
                false
            }
        }
    }

    /// Window a room message and queue it for archiving.
    ///
    /// Private messages go to the room conversation and to the one-to-one
    /// conversation of the two occupants, each as configured. The room archive
    /// id is returned when both are written.
    #[instrument(skip(self, event), fields(room = %event.room, nickname = %event.nickname))]
    pub fn process_room_message(&self, event: &RoomMessageEvent) -> Option<i64> {
        let Some(addressee) = &event.private_to else {
            return self.archive_room_message(event);
        };
        if event.body.is_none() {
            return None;
        }

        let archiving = &self.config.archiving;
        let personal = if archiving.pm_in_personal_archive {
            self.process_message(&MessageEvent {
                from: event.sender.clone(),
                to: addressee.clone(),
                body: event.body.clone(),
                stanza: event.stanza.clone(),
                at: event.at,
            })
        } else {
            None
        };
        let room = if archiving.pm_in_room_archive {
            self.archive_room_message(event)
        } else {
            None
        };
        room.or(personal)
    }

    fn archive_room_message(&self, event: &RoomMessageEvent) -> Option<i64> {
        let key = ConversationKey::room(&event.room);
        let conversation_id = self.touch(key.clone(), event.at, |id| {
            let mut conversation =
                Conversation::start(id, key.clone(), Some(event.room.clone()), false, event.at);
            let start = conversation.start_date;
            let mut joins = Vec::new();
            for occupant in &event.occupants {
                joins.extend(conversation.participant_joined(
                    &occupant.jid,
                    Some(&occupant.nickname),
                    start,
                ));
            }
            (conversation, joins)
        });

        if !self.config.archiving.room_archived(&event.room)
            || (event.body.is_none() && event.stanza.is_none() && event.subject.is_none())
        {
            return None;
        }

        let stanza = if self.config.archiving.room_stanzas {
            event.stanza.clone()
        } else {
            None
        };
        let id = self.message_ids.next_id();

        match (&event.private_to, self.config.store.room_backend) {
            (None, RoomBackend::Legacy) => {
                self.write.room_logs.archive(RoomLogRecord {
                    room: event.room.clone(),
                    message_id: id,
                    sender: event.sender.clone(),
                    nickname: Some(event.nickname.clone()),
                    log_time: event.at,
                    subject: event.subject.clone(),
                    body: event.body.clone(),
                    stanza,
                });
            }
            (private_to, _) => {
                let occupant = event
                    .room
                    .with_resource_str(&event.nickname)
                    .map(Jid::from)
                    .unwrap_or_else(|_| Jid::from(event.room.clone()));
                self.write.messages.archive(MessageRecord {
                    id,
                    conversation_id,
                    from: event.sender.clone(),
                    to: occupant,
                    sent_date: event.at,
                    body: event.body.clone(),
                    stanza,
                    is_pm_for: private_to.as_ref().map(Jid::to_bare),
                    groupchat: true,
                });
            }
        }
        Some(id)
    }

    /// Record an occupant joining a room with an active conversation.
    pub fn occupant_joined(&self, room: &BareJid, user: &Jid, nickname: &str, at: DateTime<Utc>) {
        let key = ConversationKey::room(room);
        let _guard = self.stripe(&key);
        if let Some(mut conversation) = self.conversations.get_mut(&key) {
            let updates = conversation.participant_joined(user, Some(nickname), at);
            self.queue_participations(updates);
        }
    }

    /// Record an occupant leaving. The conversation ends with its last occupant.
    pub fn occupant_left(&self, room: &BareJid, user: &Jid, at: DateTime<Utc>) {
        let key = ConversationKey::room(room);
        let mut notices = Vec::new();
        {
            let _guard = self.stripe(&key);
            let empty = match self.conversations.get_mut(&key) {
                Some(mut conversation) => {
                    if let Some(update) = conversation.participant_left(user, at) {
                        self.write.participations.archive(update);
                    }
                    conversation.open_participants() == 0
                }
                None => false,
            };
            if empty {
                if let Some((_, conversation)) = self.conversations.remove(&key) {
                    self.finish(conversation, &mut notices);
                }
            }
        }
        self.notify(notices);
    }

    pub fn nickname_changed(
        &self,
        room: &BareJid,
        user: &Jid,
        new_nickname: &str,
        at: DateTime<Utc>,
    ) {
        // joining again closes the participation under the old nickname
        self.occupant_joined(room, user, new_nickname, at);
    }

    pub fn room_destroyed(&self, room: &BareJid) {
        self.end_conversation(&ConversationKey::room(room));
    }

    /// End a conversation regardless of its timers.
    pub fn end_conversation(&self, key: &ConversationKey) -> bool {
        let mut notices = Vec::new();
        {
            let _guard = self.stripe(key);
            if let Some((_, conversation)) = self.conversations.remove(key) {
                self.finish(conversation, &mut notices);
            }
        }
        let ended = !notices.is_empty();
        self.notify(notices);
        ended
    }

    /// End every conversation that is stale at `now`. Returns how many ended.
    #[instrument(skip(self))]
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let idle = self.config.conversation.idle_time();
        let max = self.config.conversation.max_time();
        let keys: Vec<ConversationKey> = self
            .conversations
            .iter()
            .filter(|entry| entry.value().is_stale(now, idle, max))
            .map(|entry| entry.key().clone())
            .collect();

        let mut notices = Vec::new();
        for key in keys {
            let _guard = self.stripe(&key);
            let stale = self
                .conversations
                .get(&key)
                .is_some_and(|c| c.is_stale(now, idle, max));
            if stale {
                if let Some((_, conversation)) = self.conversations.remove(&key) {
                    self.finish(conversation, &mut notices);
                }
            }
        }

        let ended = notices.len();
        if ended > 0 {
            info!(ended, "Ended stale conversations");
        }
        self.notify(notices);
        ended
    }

    /// Apply max-age retention. No-op when archives are kept forever.
    ///
    /// Returns the ids of the purged messages.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<i64>, MamError> {
        let Some(max_age) = self.config.conversation.max_age() else {
            return Ok(Vec::new());
        };
        let deleted = self.store.purge_older_than(now - max_age).await?;
        if !deleted.is_empty() {
            info!(deleted = deleted.len(), "Purged expired archive messages");
        }
        Ok(deleted)
    }

    pub fn conversation(&self, key: &ConversationKey) -> Option<Conversation> {
        self.conversations.get(key).map(|c| c.value().clone())
    }

    /// Snapshot of the conversations currently tracked.
    pub fn active_conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        conversations.sort_by_key(|c| c.start_date);
        conversations
    }
}
