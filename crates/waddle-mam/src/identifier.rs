//! Stable stanza identifiers (XEP-0359) and their mapping to archive ids.
//!
//! Clients page with opaque tokens. A token is either the `<stanza-id/>` the
//! archive stamped on the message or, for older clients and messages without
//! one, the decimal archive id.

use std::sync::Arc;

use jid::BareJid;
use minidom::Element;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::MamError;
use crate::store::{ArchiveStore, Scope};
use crate::types::ArchivedMessage;

/// Unique and Stable Stanza IDs namespace (XEP-0359).
pub const STANZA_ID_NS: &str = "urn:xmpp:sid:0";

/// The stanza id that `by` assigned to a raw stanza.
///
/// Returns `None` for stanzas that do not parse, carry no matching
/// `<stanza-id/>`, or carry one with an empty id.
pub fn extract_stanza_id(stanza: &str, by: &BareJid) -> Option<String> {
    let element = match stanza.parse::<Element>() {
        Ok(element) => element,
        Err(e) => {
            warn!(error = %e, "Unable to parse archived stanza, ignoring its stanza-id");
            return None;
        }
    };

    element
        .children()
        .filter(|child| child.is("stanza-id", STANZA_ID_NS))
        .filter(|child| {
            child
                .attr("by")
                .and_then(|value| value.parse::<BareJid>().ok())
                .is_some_and(|value| value == *by)
        })
        .filter_map(|child| child.attr("id"))
        .find(|id| !id.trim().is_empty())
        .map(str::to_string)
}

/// Stamp a message with the stanza id assigned by `by`.
pub fn stanza_id_element(id: &str, by: &BareJid) -> Element {
    Element::builder("stanza-id", STANZA_ID_NS)
        .attr("id", id)
        .attr("by", by.to_string())
        .build()
}

/// Translates cursor tokens to archive ids and back.
#[derive(Clone)]
pub struct StableIdResolver {
    store: Arc<dyn ArchiveStore>,
}

impl StableIdResolver {
    pub fn new(store: Arc<dyn ArchiveStore>) -> Self {
        Self { store }
    }

    /// Resolve a token against the archive addressed by `scope`.
    ///
    /// A stable id match wins; otherwise a numeric token is accepted when a
    /// message with that id exists in the archive.
    #[instrument(skip(self, scope), fields(archive = %scope.archive_jid()))]
    pub async fn parse(&self, token: &str, scope: &Scope) -> Result<i64, MamError> {
        let by = scope.archive_jid();
        for (id, stanza) in self.store.stable_id_candidates(scope, token).await? {
            if extract_stanza_id(&stanza, by).as_deref() == Some(token) {
                debug!(id, "Resolved stable id");
                return Ok(id);
            }
        }

        if let Ok(id) = token.parse::<i64>() {
            if self.store.get_message(id, scope).await?.is_some() {
                return Ok(id);
            }
        }

        Err(MamError::not_found(format!(
            "No message with id '{}' in the archive of {}",
            token, by
        )))
    }

    /// Resolve a token against a room's conversation log.
    ///
    /// Room stanza ids are UUIDs, so only tokens shaped like one are looked up
    /// in the stored stanzas.
    #[instrument(skip(self), fields(room = %room))]
    pub async fn parse_room_log(&self, token: &str, room: &BareJid) -> Result<i64, MamError> {
        if Uuid::parse_str(token).is_ok() {
            for (id, stanza) in self.store.room_log_stable_id_candidates(room, token).await? {
                if extract_stanza_id(&stanza, room).as_deref() == Some(token) {
                    return Ok(id);
                }
            }
        }

        if let Ok(id) = token.parse::<i64>() {
            if self.store.get_room_log_message(id, room).await?.is_some() {
                return Ok(id);
            }
        }

        Err(MamError::not_found(format!(
            "No message with id '{}' in the log of {}",
            token, room
        )))
    }

    /// The token to hand out for `message`.
    ///
    /// With `use_stable_id`, the stanza id assigned by `by` is preferred; the
    /// archive id is used when the stanza has none.
    pub fn render(
        message: &ArchivedMessage,
        by: &BareJid,
        use_stable_id: bool,
    ) -> Result<String, MamError> {
        let id = message.id.ok_or(MamError::MissingIdentifier)?;
        if use_stable_id {
            if let Some(stable) = message.stable_id(by) {
                return Ok(stable);
            }
        }
        Ok(id.to_string())
    }
}
