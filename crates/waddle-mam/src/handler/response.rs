//! Building result, fin, form and metadata stanzas.

use chrono::{DateTime, SecondsFormat, Utc};
use jid::{BareJid, Jid};
use minidom::Element;
use uuid::Uuid;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};

use super::{DATA_FORMS_NS, DELAY_NS, FORWARD_NS, FULLTEXT_FIELD, MAM_NS, RSM_NS};
use crate::query::{ArchiveMetadata, QueryPage};
use crate::types::ArchivedMessage;

/// Wrap one archived message for delivery to the requestor.
///
/// ```xml
/// <message id='aeb213' to='juliet@capulet.lit/chamber'>
///   <result xmlns='urn:xmpp:mam:2' queryid='f27' id='28482-98726-73623'>
///     <forwarded xmlns='urn:xmpp:forward:0'>
///       <delay xmlns='urn:xmpp:delay' stamp='2010-07-10T23:08:25Z'/>
///       <message xmlns='jabber:client' from='romeo@montague.lit/orchard'
///                to='juliet@capulet.lit/balcony' type='chat'>
///         <body>Call me but love, and I'll be new baptized;</body>
///       </message>
///     </forwarded>
///   </result>
/// </message>
/// ```
///
/// Room archives present the sender as the room occupant, never by real JID.
/// Returns `None` for a message with neither a stanza nor a body.
pub fn build_result_message(
    ns: &str,
    query_id: Option<&str>,
    to: &Jid,
    archived: &ArchivedMessage,
    result_id: &str,
    room: Option<&BareJid>,
) -> Option<Message> {
    let mut inner = archived.recreate_stanza()?;
    if room.is_some() {
        inner.set_attr("from", archived.to.to_string());
        inner.set_attr("to", None::<String>);
        inner.set_attr("type", "groupchat");
    }

    let delay = Element::builder("delay", DELAY_NS)
        .attr("stamp", stamp(archived.time))
        .build();

    let forwarded = Element::builder("forwarded", FORWARD_NS)
        .append(delay)
        .append(inner)
        .build();

    let mut result = Element::builder("result", ns)
        .attr("id", result_id)
        .append(forwarded)
        .build();
    if let Some(query_id) = query_id {
        result.set_attr("queryid", query_id);
    }

    let mut msg = Message::new(Some(to.clone()));
    msg.id = Some(Uuid::now_v7().to_string());
    msg.type_ = MessageType::Normal;
    msg.payloads.push(result);
    Some(msg)
}

/// The `<fin/>` answering a query.
///
/// ```xml
/// <iq type='result' id='query1'>
///   <fin xmlns='urn:xmpp:mam:2' complete='true'>
///     <set xmlns='http://jabber.org/protocol/rsm'>
///       <first>28482-98726-73623</first>
///       <last>09af3-cc343-b409f</last>
///       <count>5</count>
///     </set>
///   </fin>
/// </iq>
/// ```
pub fn build_fin_iq(ns: &str, request: &Iq, query_id: Option<&str>, page: &QueryPage) -> Iq {
    let mut set = Element::builder("set", RSM_NS).build();

    if let Some(first) = &page.first {
        set.append_child(Element::builder("first", RSM_NS).append(first.as_str()).build());
    }
    if let Some(last) = &page.last {
        set.append_child(Element::builder("last", RSM_NS).append(last.as_str()).build());
    }
    if page.total >= 0 {
        set.append_child(
            Element::builder("count", RSM_NS)
                .append(page.total.to_string())
                .build(),
        );
    }

    let mut fin = Element::builder("fin", ns)
        .attr("complete", if page.complete { "true" } else { "false" })
        .append(set)
        .build();
    if let Some(query_id) = query_id {
        fin.set_attr("queryid", query_id);
    }

    reply(request, Some(fin))
}

/// The search form returned for a `get` query.
pub fn build_form_iq(ns: &str, request: &Iq, fulltext: bool) -> Iq {
    let field = |var: &str, type_: &str| {
        Element::builder("field", DATA_FORMS_NS)
            .attr("var", var)
            .attr("type", type_)
            .build()
    };

    let mut form = Element::builder("x", DATA_FORMS_NS)
        .attr("type", "form")
        .append(
            Element::builder("field", DATA_FORMS_NS)
                .attr("var", "FORM_TYPE")
                .attr("type", "hidden")
                .append(Element::builder("value", DATA_FORMS_NS).append(ns))
                .build(),
        )
        .append(field("with", "jid-single"))
        .append(field("start", "text-single"))
        .append(field("end", "text-single"))
        .build();
    if fulltext {
        form.append_child(field(FULLTEXT_FIELD, "text-single"));
    }

    let query = Element::builder("query", ns).append(form).build();
    reply(request, Some(query))
}

/// The archive metadata result; empty for an empty archive.
pub fn build_metadata_iq(request: &Iq, metadata: Option<&ArchiveMetadata>) -> Iq {
    let mut element = Element::builder("metadata", MAM_NS).build();
    if let Some(metadata) = metadata {
        element.append_child(
            Element::builder("start", MAM_NS)
                .attr("id", metadata.first_id.as_str())
                .attr("timestamp", stamp(metadata.first_time))
                .build(),
        );
        element.append_child(
            Element::builder("end", MAM_NS)
                .attr("id", metadata.last_id.as_str())
                .attr("timestamp", stamp(metadata.last_time))
                .build(),
        );
    }
    reply(request, Some(element))
}

fn reply(request: &Iq, payload: Option<Element>) -> Iq {
    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Result(payload),
    }
}

fn stamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{from_millis, Direction, CLIENT_NS};

    fn archived(from: &str, to: &str, groupchat: bool) -> ArchivedMessage {
        ArchivedMessage {
            id: Some(4),
            conversation_id: Some(1),
            time: from_millis(1_278_803_305_000),
            from: from.parse().unwrap(),
            to: to.parse().unwrap(),
            body: Some("Call me but love".to_string()),
            stanza: None,
            is_pm_for: None,
            direction: Direction::From,
            with: from.parse().unwrap(),
            groupchat,
        }
    }

    fn iq() -> Iq {
        Iq {
            from: Some("juliet@capulet.lit/chamber".parse().unwrap()),
            to: None,
            id: "q1".to_string(),
            payload: IqType::Set(Element::builder("query", MAM_NS).build()),
        }
    }

    #[test]
    fn test_result_message_wraps_forwarded_stanza() {
        let to: Jid = "juliet@capulet.lit/chamber".parse().unwrap();
        let msg = build_result_message(
            MAM_NS,
            Some("f27"),
            &to,
            &archived("romeo@montague.lit/orchard", "juliet@capulet.lit/balcony", false),
            "4",
            None,
        )
        .unwrap();

        let result = msg.payloads.iter().find(|p| p.is("result", MAM_NS)).unwrap();
        assert_eq!(result.attr("queryid"), Some("f27"));
        assert_eq!(result.attr("id"), Some("4"));
        let forwarded = result.get_child("forwarded", FORWARD_NS).unwrap();
        let delay = forwarded.get_child("delay", DELAY_NS).unwrap();
        assert_eq!(delay.attr("stamp"), Some("2010-07-10T23:08:25.000Z"));
        let inner = forwarded.get_child("message", CLIENT_NS).unwrap();
        assert_eq!(inner.attr("from"), Some("romeo@montague.lit/orchard"));
    }

    #[test]
    fn test_room_result_hides_real_jid() {
        let to: Jid = "juliet@capulet.lit/chamber".parse().unwrap();
        let room: BareJid = "lobby@conference.capulet.lit".parse().unwrap();
        let msg = build_result_message(
            MAM_NS,
            None,
            &to,
            &archived("nurse@capulet.lit/kitchen", "lobby@conference.capulet.lit/nurse", true),
            "4",
            Some(&room),
        )
        .unwrap();

        let xml = String::from(&Element::from(msg));
        assert!(xml.contains("from=\"lobby@conference.capulet.lit/nurse\""));
        assert!(!xml.contains("nurse@capulet.lit/kitchen"));
    }

    #[test]
    fn test_fin_carries_rsm_set() {
        let page = QueryPage {
            messages: Vec::new(),
            total: 5,
            first: Some("1".to_string()),
            last: Some("2".to_string()),
            complete: false,
        };
        let fin = build_fin_iq(MAM_NS, &iq(), Some("f27"), &page);
        let IqType::Result(Some(element)) = fin.payload else {
            panic!("expected a result payload");
        };
        assert_eq!(element.attr("complete"), Some("false"));
        assert_eq!(element.attr("queryid"), Some("f27"));
        let set = element.get_child("set", RSM_NS).unwrap();
        assert_eq!(set.get_child("first", RSM_NS).unwrap().text(), "1");
        assert_eq!(set.get_child("count", RSM_NS).unwrap().text(), "5");
        assert_eq!(fin.to.unwrap().to_string(), "juliet@capulet.lit/chamber");
    }

    #[test]
    fn test_unknown_count_is_omitted() {
        let fin = build_fin_iq(MAM_NS, &iq(), None, &QueryPage::empty(-1));
        let IqType::Result(Some(element)) = fin.payload else {
            panic!("expected a result payload");
        };
        let set = element.get_child("set", RSM_NS).unwrap();
        assert!(set.get_child("count", RSM_NS).is_none());
        assert_eq!(element.attr("complete"), Some("true"));
    }

    #[test]
    fn test_form_lists_fulltext_only_when_enabled() {
        let with = String::from(&Element::from(build_form_iq(MAM_NS, &iq(), true)));
        assert!(with.contains(FULLTEXT_FIELD));
        let without = String::from(&Element::from(build_form_iq(MAM_NS, &iq(), false)));
        assert!(!without.contains(FULLTEXT_FIELD));
    }

    #[test]
    fn test_metadata_bounds() {
        let metadata = ArchiveMetadata {
            first_id: "1".to_string(),
            first_time: from_millis(0),
            last_id: "9".to_string(),
            last_time: from_millis(60_000),
        };
        let IqType::Result(Some(element)) = build_metadata_iq(&iq(), Some(&metadata)).payload else {
            panic!("expected a result payload");
        };
        assert_eq!(element.get_child("end", MAM_NS).unwrap().attr("id"), Some("9"));

        let IqType::Result(Some(empty)) = build_metadata_iq(&iq(), None).payload else {
            panic!("expected a result payload");
        };
        assert_eq!(empty.children().count(), 0);
    }
}
