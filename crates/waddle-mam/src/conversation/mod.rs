//! Conversation windowing.
//!
//! Messages between the same pair of users, or in the same room, belong to one
//! conversation until it goes idle for longer than the idle time or outlives
//! the maximum duration. The next message then starts a new conversation.

mod manager;
mod router;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use jid::{BareJid, Jid};
use serde::Serialize;

use crate::store::{ConversationRecord, ParticipationRecord, ParticipationUpdate};

pub use manager::{ConversationManager, WritePath};
pub use router::{ConversationEvent, ConversationRouter, RouterRole};

/// Identity of the currently active conversation for an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ConversationKey {
    /// A one-to-one chat; the bare JIDs are kept sorted
    Pair(BareJid, BareJid),
    Room(BareJid),
}

impl ConversationKey {
    /// Order-independent key for a one-to-one chat.
    pub fn pair(a: &BareJid, b: &BareJid) -> Self {
        if a.as_str() <= b.as_str() {
            ConversationKey::Pair(a.clone(), b.clone())
        } else {
            ConversationKey::Pair(b.clone(), a.clone())
        }
    }

    pub fn room(room: &BareJid) -> Self {
        ConversationKey::Room(room.clone())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Pair(a, b) => write!(f, "{}_{}", a, b),
            ConversationKey::Room(room) => write!(f, "{}", room),
        }
    }
}

/// One join/leave interval of a participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participation {
    pub nickname: Option<String>,
    pub joined: DateTime<Utc>,
    pub left: Option<DateTime<Utc>>,
}

/// A room occupant at the time a room conversation starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Occupant {
    pub jid: Jid,
    pub nickname: String,
}

/// A one-to-one message as delivered by the XMPP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub from: Jid,
    pub to: Jid,
    pub body: Option<String>,
    pub stanza: Option<String>,
    pub at: DateTime<Utc>,
}

/// A room message, public or private, as delivered by the XMPP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMessageEvent {
    pub room: BareJid,
    /// Real JID of the sending occupant
    pub sender: Jid,
    pub nickname: String,
    /// Real JID of the addressee of a private message
    pub private_to: Option<Jid>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub stanza: Option<String>,
    pub at: DateTime<Utc>,
    /// Occupants present when the message was sent
    pub occupants: Vec<Occupant>,
}

/// Receives conversation lifecycle notifications.
///
/// Called after the conversation's lock is released. Implementations must not
/// block.
pub trait ConversationListener: Send + Sync {
    fn conversation_created(&self, _conversation: &Conversation) {}

    fn conversation_updated(&self, _conversation: &Conversation, _at: DateTime<Utc>) {}

    fn conversation_ended(&self, _conversation: &Conversation) {}
}

/// An active or finished conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    /// Assigned when metadata archiving is enabled
    pub id: Option<i64>,
    pub key: ConversationKey,
    pub room: Option<BareJid>,
    /// Exactly one side is outside the local domain
    pub external: bool,
    pub start_date: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: i64,
    pub participants: HashMap<Jid, Vec<Participation>>,
}

impl Conversation {
    /// Start a conversation for a message sent at `at`.
    ///
    /// The start is backdated by a millisecond so participants have joined
    /// before the first message arrives.
    pub fn start(
        id: Option<i64>,
        key: ConversationKey,
        room: Option<BareJid>,
        external: bool,
        at: DateTime<Utc>,
    ) -> Self {
        let start = at - Duration::milliseconds(1);
        Self {
            id,
            key,
            room,
            external,
            start_date: start,
            last_activity: start,
            message_count: 0,
            participants: HashMap::new(),
        }
    }

    /// Stale once idle for longer than `idle` or older than `max` at `at`.
    pub fn is_stale(&self, at: DateTime<Utc>, idle: Duration, max: Duration) -> bool {
        at - self.last_activity > idle || at - self.start_date > max
    }

    pub fn message_received(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
        self.message_count += 1;
    }

    /// Open a participation, closing a still-open one for the same JID first.
    pub fn participant_joined(
        &mut self,
        jid: &Jid,
        nickname: Option<&str>,
        at: DateTime<Utc>,
    ) -> Vec<ParticipationUpdate> {
        let mut updates = Vec::new();
        if let Some(update) = self.participant_left(jid, at) {
            updates.push(update);
        }

        let participation = Participation {
            nickname: nickname.map(str::to_string),
            joined: at,
            left: None,
        };
        if let Some(conversation_id) = self.id {
            updates.push(ParticipationUpdate::Joined(ParticipationRecord {
                conversation_id,
                jid: jid.clone(),
                nickname: participation.nickname.clone(),
                joined: at,
                left: None,
            }));
        }
        self.participants
            .entry(jid.clone())
            .or_default()
            .push(participation);
        updates
    }

    /// Close the open participation of `jid`, if any.
    pub fn participant_left(&mut self, jid: &Jid, at: DateTime<Utc>) -> Option<ParticipationUpdate> {
        let conversation_id = self.id;
        let open = self
            .participants
            .get_mut(jid)?
            .iter_mut()
            .rev()
            .find(|p| p.left.is_none())?;
        open.left = Some(at);

        conversation_id.map(|conversation_id| ParticipationUpdate::Left {
            conversation_id,
            jid: jid.clone(),
            joined: open.joined,
            left: at,
        })
    }

    /// Close every open participation at the last activity.
    pub fn end(&mut self) -> Vec<ParticipationUpdate> {
        let at = self.last_activity;
        let open: Vec<Jid> = self
            .participants
            .iter()
            .filter(|(_, list)| list.iter().any(|p| p.left.is_none()))
            .map(|(jid, _)| jid.clone())
            .collect();

        open.iter()
            .filter_map(|jid| self.participant_left(jid, at))
            .collect()
    }

    pub fn open_participants(&self) -> usize {
        self.participants
            .values()
            .filter(|list| list.iter().any(|p| p.left.is_none()))
            .count()
    }

    /// The persisted form, when the conversation has an id.
    pub fn record(&self) -> Option<ConversationRecord> {
        Some(ConversationRecord {
            id: self.id?,
            room: self.room.clone(),
            external: self.external,
            start_date: self.start_date,
            last_activity: self.last_activity,
            message_count: self.message_count,
        })
    }
}
