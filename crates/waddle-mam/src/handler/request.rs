//! Parsing of `<query xmlns='urn:xmpp:mam:2'>` payloads.
//!
//! ```xml
//! <query xmlns='urn:xmpp:mam:2' queryid='f27'>
//!   <x xmlns='jabber:x:data' type='submit'>
//!     <field var='FORM_TYPE' type='hidden'><value>urn:xmpp:mam:2</value></field>
//!     <field var='with'><value>juliet@capulet.lit</value></field>
//!     <field var='start'><value>2010-06-07T00:00:00Z</value></field>
//!   </x>
//!   <set xmlns='http://jabber.org/protocol/rsm'>
//!     <max>10</max>
//!     <after>28482-98726-73623</after>
//!   </set>
//! </query>
//! ```

use chrono::{DateTime, Utc};
use jid::Jid;
use minidom::Element;
use tracing::debug;

use super::{DATA_FORMS_NS, FULLTEXT_FIELD, RSM_NS};
use crate::error::MamError;

/// Form fields understood by the archive.
pub const SUPPORTED_FIELDS: &[&str] = &[
    "FORM_TYPE",
    "with",
    "start",
    "end",
    FULLTEXT_FIELD,
    "withtext",
    "search",
];

/// Filter and paging parameters of a MAM query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub query_id: Option<String>,
    pub with: Option<Jid>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub text: Option<String>,
    /// `None` when absent, negative or not a number
    pub max: Option<i64>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub backwards: bool,
}

/// Parse a MAM query element.
///
/// Unsupported form fields with a value are rejected unless
/// `allow_unrecognized` is set. Paging by RSM index is not supported.
pub fn parse_query(query: &Element, allow_unrecognized: bool) -> Result<ParsedQuery, MamError> {
    let mut parsed = ParsedQuery {
        query_id: query.attr("queryid").map(str::to_string),
        ..Default::default()
    };

    for child in query.children() {
        if child.is("x", DATA_FORMS_NS) {
            parse_form(child, allow_unrecognized, &mut parsed)?;
        } else if child.is("set", RSM_NS) {
            parse_rsm(child, &mut parsed)?;
        }
    }

    debug!(query = ?parsed, "Parsed MAM query");
    Ok(parsed)
}

fn parse_form(
    form: &Element,
    allow_unrecognized: bool,
    parsed: &mut ParsedQuery,
) -> Result<(), MamError> {
    let mut unsupported = Vec::new();
    let mut fulltext = None;
    let mut withtext = None;
    let mut search = None;

    for field in form.children().filter(|c| c.is("field", DATA_FORMS_NS)) {
        let var = field.attr("var").unwrap_or_default();
        let values: Vec<String> = field
            .children()
            .filter(|c| c.is("value", DATA_FORMS_NS))
            .map(|v| v.text())
            .filter(|v| !v.is_empty())
            .collect();
        let Some(first) = values.first().cloned() else {
            // empty fields are accepted whatever their name
            continue;
        };

        match var {
            "FORM_TYPE" => {}
            "with" => {
                let with = first.parse::<Jid>().map_err(|_| {
                    MamError::bad_request(Some(
                        "The value of the 'with' field must be a valid JID".to_string(),
                    ))
                })?;
                parsed.with = Some(with);
            }
            "start" => parsed.start = Some(parse_datetime(&first)?),
            "end" => parsed.end = Some(parse_datetime(&first)?),
            FULLTEXT_FIELD => fulltext = Some(values.join(" ")),
            "withtext" => withtext = Some(values.join(" ")),
            "search" => search = Some(values.join(" ")),
            other => unsupported.push(other.to_string()),
        }
    }

    if !unsupported.is_empty() && !allow_unrecognized {
        return Err(MamError::bad_request(Some(format!(
            "Unsupported field(s): {}",
            unsupported.join(", ")
        ))));
    }

    parsed.text = fulltext.or(withtext).or(search);
    Ok(())
}

fn parse_rsm(set: &Element, parsed: &mut ParsedQuery) -> Result<(), MamError> {
    if let Some(index) = set.get_child("index", RSM_NS) {
        if index.text().trim().parse::<i64>().is_ok_and(|i| i >= 0) {
            return Err(MamError::feature_not_implemented(Some(
                "Retrieving pages out of order is not supported".to_string(),
            )));
        }
    }

    if let Some(max) = set.get_child("max", RSM_NS) {
        parsed.max = max.text().trim().parse::<i64>().ok().filter(|m| *m >= 0);
    }

    if let Some(after) = set.get_child("after", RSM_NS) {
        parsed.after = Some(after.text()).filter(|a| !a.is_empty());
    }

    // <before/> asks for the last page even when empty
    if let Some(before) = set.get_child("before", RSM_NS) {
        parsed.backwards = parsed.after.is_none();
        parsed.before = Some(before.text()).filter(|b| !b.is_empty());
    }

    Ok(())
}

/// Parse an XEP-0082 / RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, MamError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MamError::bad_request(Some(format!("Invalid datetime '{}': {}", s, e))))
}
