//! Mapping archived messages onto index documents.

use chrono::{DateTime, Utc};
use jid::Jid;

use crate::config::ServerConfig;
use crate::store::IndexableMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Personal,
    Room,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Personal => "personal",
            DocumentKind::Room => "room",
        }
    }
}

/// One row of the FTS table. A message yields one document per archive it
/// appears in.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub message_id: i64,
    pub kind: DocumentKind,
    /// Bare JID of the archive
    pub owner: String,
    pub with_bare: String,
    pub with_resource: Option<String>,
    /// Sender nickname, room documents only
    pub nickname: Option<String>,
    pub body: String,
    pub sent_date: DateTime<Utc>,
    pub pm_from: Option<String>,
    pub pm_to: Option<String>,
}

/// Documents for a message.
///
/// Room traffic, private messages included, gets a single room document and
/// is only searchable through the room archive. One-to-one messages get a
/// personal document for each local party.
pub fn documents_for(message: &IndexableMessage, server: &ServerConfig) -> Vec<IndexDocument> {
    let record = &message.record;
    let Some(body) = record.body.clone() else {
        return Vec::new();
    };

    let document = |kind: DocumentKind, owner: String, with: &Jid| IndexDocument {
        message_id: record.id,
        kind,
        owner,
        with_bare: with.to_bare().to_string(),
        with_resource: with.resource().map(|r| r.as_str().to_string()),
        nickname: None,
        body: body.clone(),
        sent_date: record.sent_date,
        pm_from: None,
        pm_to: None,
    };

    if let Some(room) = &message.room {
        let mut room_document = document(DocumentKind::Room, room.to_string(), &record.from);
        room_document.nickname = record.to.resource().map(|r| r.as_str().to_string());
        if let Some(addressee) = &record.is_pm_for {
            room_document.pm_from = Some(record.from.to_bare().to_string());
            room_document.pm_to = Some(addressee.to_string());
        }
        return vec![room_document];
    }

    let mut documents = Vec::new();
    if server.is_local(&record.from) {
        documents.push(document(
            DocumentKind::Personal,
            record.from.to_bare().to_string(),
            &record.to,
        ));
    }
    if server.is_local(&record.to) && record.to.to_bare() != record.from.to_bare() {
        documents.push(document(
            DocumentKind::Personal,
            record.to.to_bare().to_string(),
            &record.from,
        ));
    }
    documents
}

/// Quote every whitespace-separated term of user input as an FTS5 string.
///
/// Returns `None` when the input holds no terms.
pub fn quote_terms(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{from_millis, MessageRecord};

    fn server() -> ServerConfig {
        ServerConfig {
            domain: "capulet.lit".to_string(),
            admins: Vec::new(),
        }
    }

    fn message(from: &str, to: &str, pm_for: Option<&str>, room: Option<&str>) -> IndexableMessage {
        IndexableMessage {
            stored_seq: 11,
            record: MessageRecord {
                id: 11,
                conversation_id: Some(2),
                from: from.parse().unwrap(),
                to: to.parse().unwrap(),
                sent_date: from_millis(5_000),
                body: Some("wherefore art thou".to_string()),
                stanza: None,
                is_pm_for: pm_for.map(|j| j.parse().unwrap()),
                groupchat: room.is_some(),
            },
            room: room.map(|r| r.parse().unwrap()),
        }
    }

    #[test]
    fn test_one_to_one_indexes_local_parties_only() {
        let docs = documents_for(
            &message("juliet@capulet.lit/balcony", "romeo@montague.lit", None, None),
            &server(),
        );
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].owner, "juliet@capulet.lit");
        assert_eq!(docs[0].with_bare, "romeo@montague.lit");
        assert_eq!(docs[0].kind, DocumentKind::Personal);
    }

    #[test]
    fn test_public_room_message_is_room_document_only() {
        let docs = documents_for(
            &message(
                "nurse@capulet.lit/kitchen",
                "lobby@conference.capulet.lit/nurse",
                None,
                Some("lobby@conference.capulet.lit"),
            ),
            &server(),
        );
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].kind, DocumentKind::Room);
        assert_eq!(docs[0].owner, "lobby@conference.capulet.lit");
        assert_eq!(docs[0].with_bare, "nurse@capulet.lit");
        assert_eq!(docs[0].nickname.as_deref(), Some("nurse"));
        assert!(docs[0].pm_to.is_none());
    }

    #[test]
    fn test_private_room_message_stays_in_room_archive() {
        let docs = documents_for(
            &message(
                "nurse@capulet.lit/kitchen",
                "lobby@conference.capulet.lit/juliet",
                Some("juliet@capulet.lit"),
                Some("lobby@conference.capulet.lit"),
            ),
            &server(),
        );
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].kind, DocumentKind::Room);
        assert_eq!(docs[0].pm_to.as_deref(), Some("juliet@capulet.lit"));
        assert_eq!(docs[0].pm_from.as_deref(), Some("nurse@capulet.lit"));
    }

    #[test]
    fn test_quote_terms() {
        assert_eq!(quote_terms("  "), None);
        assert_eq!(
            quote_terms("rose by\t\"any\""),
            Some("\"rose\" \"by\" \"\"\"any\"\"\"".to_string())
        );
        assert_eq!(quote_terms("NEAR(a"), Some("\"NEAR(a\"".to_string()));
    }
}
