//! Versioned schema migrations for the archive database.
//!
//! Applied versions are tracked in `mam_migrations`; each migration runs once,
//! in version order.

use libsql::Connection;
use tracing::{debug, info, instrument};

use super::StoreError;

/// A single schema migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number (unique, increasing)
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Conversations, participants and messages.
pub const V0001_ARCHIVE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mam_conversation (
    conversation_id INTEGER PRIMARY KEY,
    -- Room JID for group conversations, NULL for one-to-one chats
    room TEXT,
    is_external INTEGER NOT NULL DEFAULT 0,
    -- Epoch milliseconds
    start_date INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_mam_conversation_last_activity
    ON mam_conversation(last_activity);

CREATE TABLE IF NOT EXISTS mam_participant (
    conversation_id INTEGER NOT NULL,
    joined_date INTEGER NOT NULL,
    left_date INTEGER,
    bare_jid TEXT NOT NULL,
    -- A single space when the participant has no resource
    jid_resource TEXT NOT NULL,
    nickname TEXT
);

CREATE INDEX IF NOT EXISTS idx_mam_participant_conversation
    ON mam_participant(conversation_id, bare_jid, jid_resource, joined_date);

CREATE TABLE IF NOT EXISTS mam_message (
    -- Assigned on arrival, not at flush time
    id INTEGER PRIMARY KEY,
    conversation_id INTEGER,
    from_jid TEXT NOT NULL,
    from_resource TEXT,
    to_jid TEXT NOT NULL,
    to_resource TEXT,
    sent_date INTEGER NOT NULL,
    body TEXT,
    stanza TEXT,
    -- Addressee of a private room message
    is_pm_for_jid TEXT,
    -- "chat" or "groupchat"
    message_type TEXT NOT NULL DEFAULT 'chat'
);

CREATE INDEX IF NOT EXISTS idx_mam_message_from ON mam_message(from_jid, sent_date);
CREATE INDEX IF NOT EXISTS idx_mam_message_to ON mam_message(to_jid, sent_date);
CREATE INDEX IF NOT EXISTS idx_mam_message_pm ON mam_message(is_pm_for_jid);
CREATE INDEX IF NOT EXISTS idx_mam_message_conversation ON mam_message(conversation_id);
"#;

/// The host's room conversation log, read by the legacy room backend.
pub const V0002_ROOM_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS muc_conversation_log (
    room_jid TEXT NOT NULL,
    message_id INTEGER,
    -- Real JID of the occupant
    sender TEXT NOT NULL,
    nickname TEXT,
    log_time INTEGER NOT NULL,
    subject TEXT,
    body TEXT,
    stanza TEXT
);

CREATE INDEX IF NOT EXISTS idx_muc_log_room_time ON muc_conversation_log(room_jid, log_time);
CREATE INDEX IF NOT EXISTS idx_muc_log_message_id ON muc_conversation_log(message_id);
"#;

/// Position of each row in store order. Ids follow arrival, but batches can
/// land out of id order; the full-text indexer follows this column instead.
pub const V0003_STORED_SEQUENCE: &str = r#"
ALTER TABLE mam_message ADD COLUMN stored_seq INTEGER;
UPDATE mam_message SET stored_seq = id WHERE stored_seq IS NULL;
CREATE INDEX IF NOT EXISTS idx_mam_message_stored_seq ON mam_message(stored_seq);
"#;

/// All archive migrations in order.
pub fn all() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Archive conversations, participants and messages",
            sql: V0001_ARCHIVE_SCHEMA,
        },
        Migration {
            version: 2,
            description: "Room conversation log",
            sql: V0002_ROOM_LOG,
        },
        Migration {
            version: 3,
            description: "Store order of archived messages",
            sql: V0003_STORED_SEQUENCE,
        },
    ]
}

/// Applies pending migrations to a connection.
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new(all())
    }
}

impl MigrationRunner {
    pub fn new(migrations: Vec<Migration>) -> Self {
        let mut sorted = migrations;
        sorted.sort_by_key(|m| m.version);
        Self { migrations: sorted }
    }

    /// Run every migration not yet recorded. Returns the newly applied versions.
    #[instrument(skip_all)]
    pub async fn run(&self, conn: &Connection) -> Result<Vec<i64>, StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS mam_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            (),
        )
        .await?;

        let mut applied: Vec<i64> = Vec::new();
        let mut rows = conn
            .query("SELECT version FROM mam_migrations ORDER BY version", ())
            .await?;
        while let Some(row) = rows.next().await? {
            applied.push(row.get(0)?);
        }

        debug!("Already applied migrations: {:?}", applied);

        let mut newly_applied = Vec::new();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                continue;
            }

            info!(
                "Applying migration v{}: {}",
                migration.version, migration.description
            );

            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Database(format!("Migration v{} failed: {}", migration.version, e))
            })?;

            conn.execute(
                "INSERT INTO mam_migrations (version, description) VALUES (?1, ?2)",
                (migration.version, migration.description),
            )
            .await?;

            newly_applied.push(migration.version);
        }

        if !newly_applied.is_empty() {
            info!("Applied {} new migrations", newly_applied.len());
        }

        Ok(newly_applied)
    }
}
