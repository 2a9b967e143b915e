//! Archive query construction.
//!
//! Filter construction (the `WHERE` clause and its positional parameters) is kept
//! apart from the pagination clause, which differs per SQL dialect and is emitted
//! by [`SqlDialect::select_page`].

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use libsql::Value;

use crate::types::to_millis;

/// Pagination syntax families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    MySql,
    Postgres,
    SqlServer,
    Oracle,
}

impl SqlDialect {
    /// Build a bounded, ordered select.
    pub fn select_page(
        &self,
        columns: &str,
        from: &str,
        where_clause: &str,
        order_by: &str,
        limit: usize,
    ) -> String {
        match self {
            SqlDialect::Sqlite | SqlDialect::MySql | SqlDialect::Postgres => format!(
                "SELECT {columns} FROM {from} WHERE {where_clause} ORDER BY {order_by} LIMIT {limit}"
            ),
            SqlDialect::SqlServer => format!(
                "SELECT TOP({limit}) {columns} FROM {from} WHERE {where_clause} ORDER BY {order_by}"
            ),
            SqlDialect::Oracle => format!(
                "SELECT {columns} FROM {from} WHERE {where_clause} ORDER BY {order_by} FETCH FIRST {limit} ROWS ONLY"
            ),
        }
    }
}

/// Which archive a query addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// A user's personal archive
    Personal { owner: BareJid },
    /// A room archive, read on behalf of `message_owner`, who additionally sees
    /// the private messages they sent or received in the room
    Room {
        room: BareJid,
        message_owner: BareJid,
    },
}

impl Scope {
    /// The JID whose archive is addressed.
    pub fn archive_jid(&self) -> &BareJid {
        match self {
            Scope::Personal { owner } => owner,
            Scope::Room { room, .. } => room,
        }
    }

    fn push_clause(&self, clauses: &mut Vec<String>, params: &mut Vec<Value>) {
        match self {
            Scope::Personal { owner } => {
                // room traffic, private or not, lives in the room archive only
                clauses.push(
                    "(from_jid = ? OR to_jid = ?) AND message_type <> 'groupchat'".to_string(),
                );
                let owner = owner.to_string();
                params.push(owner.clone().into());
                params.push(owner.into());
            }
            Scope::Room {
                room,
                message_owner,
            } => {
                clauses.push(
                    "to_jid = ? AND message_type = 'groupchat' \
                     AND (is_pm_for_jid IS NULL OR is_pm_for_jid = ? OR from_jid = ?)"
                        .to_string(),
                );
                let owner = message_owner.to_string();
                params.push(room.to_string().into());
                params.push(owner.clone().into());
                params.push(owner.into());
            }
        }
    }
}

/// Cursor and size of one page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    /// Only ids strictly greater than this
    pub after: Option<i64>,
    /// Only ids strictly smaller than this
    pub before: Option<i64>,
    pub limit: usize,
    pub backwards: bool,
}

impl Page {
    pub fn forward(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn backward(limit: usize) -> Self {
        Self {
            limit,
            backwards: true,
            ..Default::default()
        }
    }
}

/// Filter over the archive's own message table.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFilter {
    pub scope: Scope,
    pub with: Option<Jid>,
    /// Inclusive lower bound
    pub start: DateTime<Utc>,
    /// Inclusive upper bound
    pub end: DateTime<Utc>,
}

pub(crate) const MESSAGE_COLUMNS: &str = "id, conversation_id, from_jid, from_resource, to_jid, \
     to_resource, sent_date, body, stanza, is_pm_for_jid, message_type";

impl MessageFilter {
    /// The `WHERE` clause and its parameters, with optional cursor bounds.
    pub fn where_clause(&self, page: Option<&Page>) -> (String, Vec<Value>) {
        let mut clauses = vec!["(stanza IS NOT NULL OR body IS NOT NULL)".to_string()];
        let mut params: Vec<Value> = Vec::new();

        clauses.push("sent_date >= ?".to_string());
        params.push(to_millis(self.start).into());
        clauses.push("sent_date <= ?".to_string());
        params.push(to_millis(self.end).into());

        self.scope.push_clause(&mut clauses, &mut params);

        if let Some(with) = &self.with {
            self.push_with(with, &mut clauses, &mut params);
        }

        if let Some(page) = page {
            push_cursor("id", page, &mut clauses, &mut params);
        }

        (clauses.join(" AND "), params)
    }

    fn push_with(&self, with: &Jid, clauses: &mut Vec<String>, params: &mut Vec<Value>) {
        let bare = with.to_bare().to_string();
        let resource = with.resource().map(|r| r.as_str().to_string());

        match (&self.scope, resource) {
            (Scope::Personal { .. }, None) => {
                clauses.push("(to_jid = ? OR from_jid = ?)".to_string());
                params.push(bare.clone().into());
                params.push(bare.into());
            }
            (Scope::Personal { .. }, Some(resource)) => {
                clauses.push(
                    "((to_jid = ? AND to_resource = ?) OR (from_jid = ? AND from_resource = ?))"
                        .to_string(),
                );
                params.push(bare.clone().into());
                params.push(resource.clone().into());
                params.push(bare.into());
                params.push(resource.into());
            }
            (Scope::Room { .. }, None) => {
                clauses.push("from_jid = ?".to_string());
                params.push(bare.into());
            }
            (Scope::Room { room, .. }, Some(resource)) if with.to_bare() == *room => {
                // an occupant JID: the nickname is stored as the recipient resource
                clauses.push("to_resource = ?".to_string());
                params.push(resource.into());
            }
            (Scope::Room { .. }, Some(resource)) => {
                clauses.push("(from_jid = ? AND from_resource = ?)".to_string());
                params.push(bare.into());
                params.push(resource.into());
            }
        }
    }

    /// Ordered, bounded select for one page.
    pub fn select(&self, dialect: SqlDialect, page: &Page) -> (String, Vec<Value>) {
        let (where_clause, params) = self.where_clause(Some(page));
        let order = if page.backwards {
            "sent_date DESC, id DESC"
        } else {
            "sent_date ASC, id ASC"
        };
        (
            dialect.select_page(MESSAGE_COLUMNS, "mam_message", &where_clause, order, page.limit),
            params,
        )
    }

    /// Distinct-id count of the filter, without cursors or limit.
    pub fn count(&self) -> (String, Vec<Value>) {
        let (where_clause, params) = self.where_clause(None);
        (
            format!("SELECT COUNT(DISTINCT id) FROM mam_message WHERE {where_clause}"),
            params,
        )
    }
}

/// Filter over the host's room conversation log.
///
/// The lower time bound is exclusive, matching how the host queries its log.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomLogFilter {
    pub room: BareJid,
    pub with: Option<Jid>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub(crate) const ROOM_LOG_COLUMNS: &str =
    "message_id, sender, nickname, log_time, subject, body, stanza, room_jid";

impl RoomLogFilter {
    pub fn where_clause(&self, page: Option<&Page>) -> (String, Vec<Value>) {
        let mut clauses = vec![
            "message_id IS NOT NULL".to_string(),
            "log_time > ?".to_string(),
            "log_time <= ?".to_string(),
            "room_jid = ?".to_string(),
            "(nickname IS NOT NULL OR subject IS NOT NULL)".to_string(),
        ];
        let mut params: Vec<Value> = vec![
            to_millis(self.start).into(),
            to_millis(self.end).into(),
            self.room.to_string().into(),
        ];

        if let Some(with) = &self.with {
            if with.resource().is_none() {
                clauses.push("sender LIKE ? ESCAPE '\\'".to_string());
                params.push(format!("{}%", like_escape(&with.to_string())).into());
            } else {
                clauses.push("sender = ?".to_string());
                params.push(with.to_string().into());
            }
        }

        if let Some(page) = page {
            push_cursor("message_id", page, &mut clauses, &mut params);
        }

        (clauses.join(" AND "), params)
    }

    pub fn select(&self, dialect: SqlDialect, page: &Page) -> (String, Vec<Value>) {
        let (where_clause, params) = self.where_clause(Some(page));
        let order = if page.backwards {
            "log_time DESC, message_id DESC"
        } else {
            "log_time ASC, message_id ASC"
        };
        (
            dialect.select_page(
                ROOM_LOG_COLUMNS,
                "muc_conversation_log",
                &where_clause,
                order,
                page.limit,
            ),
            params,
        )
    }

    pub fn count(&self) -> (String, Vec<Value>) {
        let (where_clause, params) = self.where_clause(None);
        (
            format!("SELECT COUNT(*) FROM muc_conversation_log WHERE {where_clause}"),
            params,
        )
    }
}

fn push_cursor(column: &str, page: &Page, clauses: &mut Vec<String>, params: &mut Vec<Value>) {
    if let Some(after) = page.after {
        clauses.push(format!("{column} > ?"));
        params.push(after.into());
    }
    if let Some(before) = page.before {
        clauses.push(format!("{column} < ?"));
        params.push(before.into());
    }
}

/// Bare JIDs never contain `%`, but `_` is legal in node names.
fn like_escape(raw: &str) -> String {
    raw.replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::from_millis;

    fn personal(with: Option<&str>) -> MessageFilter {
        MessageFilter {
            scope: Scope::Personal {
                owner: "juliet@capulet.lit".parse().unwrap(),
            },
            with: with.map(|w| w.parse().unwrap()),
            start: from_millis(0),
            end: from_millis(10_000),
        }
    }

    #[test]
    fn test_limit_dialects() {
        for dialect in [SqlDialect::Sqlite, SqlDialect::MySql, SqlDialect::Postgres] {
            let sql = dialect.select_page("a, b", "t", "x = ?", "a ASC", 25);
            assert_eq!(sql, "SELECT a, b FROM t WHERE x = ? ORDER BY a ASC LIMIT 25");
        }
    }

    #[test]
    fn test_top_dialect() {
        let sql = SqlDialect::SqlServer.select_page("a, b", "t", "x = ?", "a DESC", 10);
        assert_eq!(sql, "SELECT TOP(10) a, b FROM t WHERE x = ? ORDER BY a DESC");
    }

    #[test]
    fn test_fetch_first_dialect() {
        let sql = SqlDialect::Oracle.select_page("a", "t", "1 = 1", "a ASC", 5);
        assert_eq!(
            sql,
            "SELECT a FROM t WHERE 1 = 1 ORDER BY a ASC FETCH FIRST 5 ROWS ONLY"
        );
    }

    #[test]
    fn test_personal_filter_parameters() {
        let (clause, params) = personal(None).where_clause(None);
        assert!(clause.contains("sent_date >= ?"));
        assert!(clause.contains("message_type <> 'groupchat'"));
        assert!(!clause.contains("is_pm_for_jid"));
        assert!(!clause.contains("id > ?"));
        // start, end and two owner slots
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_bare_with_matches_both_directions() {
        let (clause, params) = personal(Some("romeo@montague.lit")).where_clause(None);
        assert!(clause.contains("(to_jid = ? OR from_jid = ?)"));
        assert_eq!(params.len(), 7);
    }

    #[test]
    fn test_full_with_constrains_resource() {
        let (clause, params) = personal(Some("romeo@montague.lit/orchard")).where_clause(None);
        assert!(clause.contains("to_resource = ?"));
        assert!(clause.contains("from_resource = ?"));
        assert_eq!(params.len(), 9);
    }

    #[test]
    fn test_room_occupant_with_maps_to_nickname() {
        let filter = MessageFilter {
            scope: Scope::Room {
                room: "lobby@conference.capulet.lit".parse().unwrap(),
                message_owner: "juliet@capulet.lit".parse().unwrap(),
            },
            with: Some("lobby@conference.capulet.lit/nurse".parse().unwrap()),
            start: from_millis(0),
            end: from_millis(1),
        };
        let (clause, params) = filter.where_clause(None);
        assert!(clause.ends_with("to_resource = ?"));
        assert_eq!(params.last(), Some(&Value::Text("nurse".to_string())));
    }

    #[test]
    fn test_cursor_bounds_and_order() {
        let page = Page {
            after: Some(3),
            before: Some(9),
            limit: 4,
            backwards: true,
        };
        let (sql, params) = personal(None).select(SqlDialect::Sqlite, &page);
        assert!(sql.contains("id > ?"));
        assert!(sql.contains("id < ?"));
        assert!(sql.contains("ORDER BY sent_date DESC, id DESC LIMIT 4"));
        assert_eq!(params[params.len() - 2], Value::Integer(3));
        assert_eq!(params[params.len() - 1], Value::Integer(9));
    }

    #[test]
    fn test_count_ignores_cursor() {
        let (sql, _) = personal(None).count();
        assert!(sql.starts_with("SELECT COUNT(DISTINCT id) FROM mam_message"));
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn test_room_log_with_filters() {
        let mut filter = RoomLogFilter {
            room: "lobby@conference.capulet.lit".parse().unwrap(),
            with: Some("romeo@montague.lit".parse().unwrap()),
            start: from_millis(0),
            end: from_millis(1),
        };
        let (clause, params) = filter.where_clause(None);
        assert!(clause.contains("log_time > ?"));
        assert!(clause.contains("sender LIKE ?"));
        assert_eq!(params[3], Value::Text("romeo@montague.lit%".to_string()));

        filter.with = Some("romeo@montague.lit/orchard".parse().unwrap());
        let (clause, _) = filter.where_clause(None);
        assert!(clause.contains("sender = ?"));
    }
}
