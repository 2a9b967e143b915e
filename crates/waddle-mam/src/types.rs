//! Common types for the message archive.

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use minidom::Element;
use serde::{Deserialize, Serialize};

use crate::identifier;

/// Client namespace used when a stanza has to be rebuilt from its body.
pub const CLIENT_NS: &str = "jabber:client";

/// Direction of an archived message relative to the archive owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The message was sent to the owner by `with`
    From,
    /// The message was sent by the owner to `with`
    To,
}

impl Direction {
    /// Messages addressed to the owner's bare JID are incoming.
    pub fn for_owner(owner: &BareJid, to: &Jid) -> Self {
        if to.to_bare() == *owner {
            Direction::From
        } else {
            Direction::To
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::From => "from",
            Direction::To => "to",
        }
    }
}

const PUBSUB_EVENT_NS: &str = "http://jabber.org/protocol/pubsub#event";
const CHAT_MARKERS_NS: &str = "urn:xmpp:chat-markers:0";
const RETRACT_NS: &str = "urn:xmpp:message-retract:0";
const CHATSTATES_NS: &str = "http://jabber.org/protocol/chatstates";
const RECEIPTS_NS: &str = "urn:xmpp:receipts";

/// What a one-to-one message without a body carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyMessageKind {
    /// None of the payloads below, or a stanza that does not parse
    Unknown,
    Markable,
    Received,
    Displayed,
    Acknowledged,
    Retraction,
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
    ReceiptReceived,
    ReceiptRequest,
}

impl EmptyMessageKind {
    /// Classify a raw body-less stanza. Pubsub notifications are never
    /// archived and yield `None`.
    pub fn classify(stanza: &str) -> Option<Self> {
        let Ok(element) = stanza.parse::<Element>() else {
            return Some(EmptyMessageKind::Unknown);
        };
        if has_descendant(&element, "event", PUBSUB_EVENT_NS) {
            return None;
        }

        const KINDS: &[(&str, &str, EmptyMessageKind)] = &[
            ("markable", CHAT_MARKERS_NS, EmptyMessageKind::Markable),
            ("received", CHAT_MARKERS_NS, EmptyMessageKind::Received),
            ("displayed", CHAT_MARKERS_NS, EmptyMessageKind::Displayed),
            ("acknowledged", CHAT_MARKERS_NS, EmptyMessageKind::Acknowledged),
            ("retract", RETRACT_NS, EmptyMessageKind::Retraction),
            ("active", CHATSTATES_NS, EmptyMessageKind::Active),
            ("composing", CHATSTATES_NS, EmptyMessageKind::Composing),
            ("paused", CHATSTATES_NS, EmptyMessageKind::Paused),
            ("inactive", CHATSTATES_NS, EmptyMessageKind::Inactive),
            ("gone", CHATSTATES_NS, EmptyMessageKind::Gone),
            ("received", RECEIPTS_NS, EmptyMessageKind::ReceiptReceived),
            ("request", RECEIPTS_NS, EmptyMessageKind::ReceiptRequest),
        ];
        let kind = KINDS
            .iter()
            .find(|(name, ns, _)| has_descendant(&element, name, ns))
            .map_or(EmptyMessageKind::Unknown, |(_, _, kind)| *kind);
        Some(kind)
    }
}

fn has_descendant(element: &Element, name: &str, ns: &str) -> bool {
    element
        .children()
        .any(|child| child.is(name, ns) || has_descendant(child, name, ns))
}

/// A message row as persisted by the archive store.
///
/// The id is assigned when the message arrives, before it is queued, so that id
/// order follows arrival order even though rows are written in batches.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    /// Sequential archive id
    pub id: i64,
    /// Owning conversation, when conversation metadata is archived
    pub conversation_id: Option<i64>,
    /// Sender (bare or full)
    pub from: Jid,
    /// Recipient; for room traffic the room JID with the sender's nickname
    pub to: Jid,
    /// When the message was sent
    pub sent_date: DateTime<Utc>,
    /// Message body
    pub body: Option<String>,
    /// Raw stanza XML
    pub stanza: Option<String>,
    /// Addressee of a private room message
    pub is_pm_for: Option<BareJid>,
    /// Sent through a room, publicly or as a private message
    pub groupchat: bool,
}

/// An archived message as seen from one archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedMessage {
    /// Sequential archive id; `None` only for messages that were never persisted
    pub id: Option<i64>,
    pub conversation_id: Option<i64>,
    pub time: DateTime<Utc>,
    pub from: Jid,
    pub to: Jid,
    pub body: Option<String>,
    pub stanza: Option<String>,
    pub is_pm_for: Option<BareJid>,
    pub direction: Direction,
    /// The conversation partner, from the owner's point of view
    pub with: Jid,
    pub groupchat: bool,
}

impl ArchivedMessage {
    /// View a stored row from the perspective of `owner`.
    pub fn from_record(owner: &BareJid, record: MessageRecord) -> Self {
        let direction = Direction::for_owner(owner, &record.to);
        let with = match direction {
            Direction::From => record.from.clone(),
            Direction::To => record.to.clone(),
        };

        Self {
            id: Some(record.id),
            conversation_id: record.conversation_id,
            time: record.sent_date,
            from: record.from,
            to: record.to,
            body: record.body,
            stanza: record.stanza,
            is_pm_for: record.is_pm_for,
            direction,
            with,
            groupchat: record.groupchat,
        }
    }

    /// The XEP-0359 stable id assigned by `by`, if the raw stanza carries one.
    ///
    /// A stanza that fails to parse is logged and treated as having no stable id.
    pub fn stable_id(&self, by: &BareJid) -> Option<String> {
        self.stanza
            .as_deref()
            .and_then(|stanza| identifier::extract_stanza_id(stanza, by))
    }

    /// The stanza to forward in a result, rebuilt from the body when no raw
    /// stanza was archived.
    pub fn recreate_stanza(&self) -> Option<Element> {
        if let Some(parsed) = self.stanza.as_deref().and_then(|s| s.parse::<Element>().ok()) {
            return Some(parsed);
        }

        let body = self.body.as_deref()?;
        Some(
            Element::builder("message", CLIENT_NS)
                .attr("from", self.from.to_string())
                .attr("to", self.to.to_string())
                .attr("type", if self.groupchat { "groupchat" } else { "chat" })
                .append(Element::builder("body", CLIENT_NS).append(body))
                .build(),
        )
    }
}

/// Split a JID into its bare form and optional resource.
pub fn split_jid(jid: &Jid) -> (String, Option<String>) {
    (
        jid.to_bare().to_string(),
        jid.resource().map(|r| r.as_str().to_string()),
    )
}

/// Join a stored bare JID and resource back together.
pub fn join_jid(bare: &str, resource: Option<&str>) -> Result<Jid, jid::Error> {
    match resource.filter(|r| !r.trim().is_empty()) {
        Some(resource) => Ok(Jid::from(BareJid::new(bare)?.with_resource_str(resource)?)),
        None => Ok(Jid::from(BareJid::new(bare)?)),
    }
}

/// Epoch milliseconds used for every stored timestamp.
pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}
