//! Archive configuration.
//!
//! Loaded from TOML, with `WADDLE_MAM_*` environment variables taking precedence.
//! Every section is optional and falls back to the defaults below.
//!
//! ```toml
//! [server]
//! domain = "example.com"
//! admins = ["admin@example.com"]
//!
//! [archiving]
//! messages = true
//! rooms = true
//! rooms_archived = ["lobby"]
//!
//! [conversation]
//! idle_time_minutes = 10
//! max_time_minutes = 60
//! ```

use jid::{BareJid, Jid};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::types::EmptyMessageKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub archiving: ArchivingConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub archiver: ArchiverConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The local XMPP domain and its administrators.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Bare JIDs allowed to read any personal archive
    #[serde(default)]
    pub admins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            admins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// A JID is local when its domain is the server domain or a subdomain of it.
    pub fn is_local(&self, jid: &Jid) -> bool {
        let domain = jid.domain().as_str();
        domain == self.domain || domain.ends_with(&format!(".{}", self.domain))
    }

    pub fn is_admin(&self, jid: &BareJid) -> bool {
        let jid = jid.to_string();
        self.admins.iter().any(|admin| *admin == jid)
    }
}

/// What gets written to the archive.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchivingConfig {
    /// Conversation and participant metadata
    #[serde(default = "default_true")]
    pub metadata: bool,
    /// One-to-one message bodies
    #[serde(default)]
    pub messages: bool,
    /// Room message bodies
    #[serde(default)]
    pub rooms: bool,
    /// Keep the raw stanza of room messages as well as the body
    #[serde(default)]
    pub room_stanzas: bool,
    /// Room node names to archive; empty archives every room
    #[serde(default)]
    pub rooms_archived: Vec<String>,
    /// Record private room messages in the room conversation
    #[serde(default = "default_true")]
    pub pm_in_room_archive: bool,
    /// Record private room messages as one-to-one messages between the
    /// occupants' real JIDs
    #[serde(default)]
    pub pm_in_personal_archive: bool,
    /// Kinds of body-less one-to-one messages to archive
    #[serde(default)]
    pub empty_messages: Vec<EmptyMessageKind>,
}

impl Default for ArchivingConfig {
    fn default() -> Self {
        Self {
            metadata: true,
            messages: false,
            rooms: false,
            room_stanzas: false,
            rooms_archived: Vec::new(),
            pm_in_room_archive: true,
            pm_in_personal_archive: false,
            empty_messages: Vec::new(),
        }
    }
}

impl ArchivingConfig {
    /// Message and room archiving both depend on conversation metadata.
    pub fn metadata_enabled(&self) -> bool {
        self.metadata || self.messages || self.rooms
    }

    pub fn archives_empty(&self, kind: EmptyMessageKind) -> bool {
        self.empty_messages.contains(&kind)
    }

    pub fn room_archived(&self, room: &BareJid) -> bool {
        if !self.rooms {
            return false;
        }
        if self.rooms_archived.is_empty() {
            return true;
        }
        let node = room.node().map(|n| n.as_str()).unwrap_or_default();
        self.rooms_archived.iter().any(|name| name == node)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_idle_time")]
    pub idle_time_minutes: u64,
    #[serde(default = "default_max_time")]
    pub max_time_minutes: u64,
    /// Conversations older than this are purged; 0 keeps everything
    #[serde(default)]
    pub max_age_days: u64,
    /// Queries never reach further back than this; 0 is unlimited
    #[serde(default)]
    pub max_retrievable_days: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_time_minutes: default_idle_time(),
            max_time_minutes: default_max_time(),
            max_age_days: 0,
            max_retrievable_days: 0,
        }
    }
}

impl ConversationConfig {
    pub fn idle_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.idle_time_minutes as i64)
    }

    pub fn max_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_time_minutes as i64)
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        (self.max_age_days > 0).then(|| chrono::Duration::days(self.max_age_days as i64))
    }

    pub fn max_retrievable(&self) -> Option<chrono::Duration> {
        (self.max_retrievable_days > 0)
            .then(|| chrono::Duration::days(self.max_retrievable_days as i64))
    }
}

/// Batching behaviour shared by every archiver.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiverConfig {
    #[serde(default = "default_work_queue")]
    pub max_work_queue_size: usize,
    #[serde(default = "default_purge_interval")]
    pub max_purge_interval_ms: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            max_work_queue_size: default_work_queue(),
            max_purge_interval_ms: default_purge_interval(),
            grace_period_ms: default_grace_period(),
        }
    }
}

impl ArchiverConfig {
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.max_purge_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Page every query, even when the client sent no RSM set
    #[serde(default = "default_true")]
    pub force_rsm: bool,
    #[serde(default = "default_max_results")]
    pub default_max: usize,
    #[serde(default = "default_room_max_results")]
    pub room_default_max: usize,
    /// Answer with an empty page instead of an error when the store fails
    #[serde(default)]
    pub ignore_retrieval_exceptions: bool,
    #[serde(default)]
    pub allow_unrecognized_fields: bool,
    /// Render XEP-0359 stable ids as RSM cursors when available
    #[serde(default = "default_true")]
    pub use_stable_ids: bool,
    /// Upper bound on the availability wait before a query runs
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
    /// Queries processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            force_rsm: true,
            default_max: default_max_results(),
            room_default_max: default_room_max_results(),
            ignore_retrieval_exceptions: false,
            allow_unrecognized_fields: false,
            use_stable_ids: true,
            max_wait_ms: default_max_wait(),
            workers: default_workers(),
        }
    }
}

impl QueryConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Companion database holding the full-text index; in memory when unset
    pub path: Option<PathBuf>,
    #[serde(default = "default_index_interval")]
    pub update_interval_minutes: u64,
    #[serde(default = "default_index_delay")]
    pub initial_delay_minutes: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            update_interval_minutes: default_index_interval(),
            initial_delay_minutes: default_index_delay(),
        }
    }
}

/// Which table room queries read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomBackend {
    /// The archive's own message table
    #[default]
    Archive,
    /// The host's room conversation log
    Legacy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Archive database; in memory when unset
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub room_backend: RoomBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_minutes: u64,
    #[serde(default = "default_retention_interval")]
    pub purge_interval_minutes: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_minutes: default_cleanup_interval(),
            purge_interval_minutes: default_retention_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_idle_time() -> u64 {
    10
}

fn default_max_time() -> u64 {
    60
}

fn default_work_queue() -> usize {
    500
}

fn default_purge_interval() -> u64 {
    1000
}

fn default_grace_period() -> u64 {
    50
}

fn default_max_results() -> usize {
    1000
}

fn default_room_max_results() -> usize {
    100
}

fn default_max_wait() -> u64 {
    30_000
}

fn default_workers() -> usize {
    8
}

fn default_index_interval() -> u64 {
    15
}

fn default_index_delay() -> u64 {
    5
}

fn default_cleanup_interval() -> u64 {
    5
}

fn default_retention_interval() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Default)]
struct ConfigOverrides {
    domain: Option<String>,
    db_path: Option<String>,
    index_path: Option<String>,
    message_archiving: Option<String>,
    log_level: Option<String>,
}

/// Load configuration from a TOML file, merging environment overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<ArchiveConfig, ConfigError> {
    let path = path.as_ref();
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, config_overrides_from_env())
}

/// Parse configuration from a TOML string, merging environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<ArchiveConfig, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

/// Defaults plus environment overrides, for running without a file.
pub fn load_default_config() -> Result<ArchiveConfig, ConfigError> {
    load_config_from_str_with_overrides("", config_overrides_from_env())
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<ArchiveConfig, ConfigError> {
    let mut config: ArchiveConfig = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides)?;
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        domain: std::env::var("WADDLE_MAM_DOMAIN").ok(),
        db_path: std::env::var("WADDLE_MAM_DB_PATH").ok(),
        index_path: std::env::var("WADDLE_MAM_INDEX_PATH").ok(),
        message_archiving: std::env::var("WADDLE_MAM_MESSAGE_ARCHIVING").ok(),
        log_level: std::env::var("WADDLE_MAM_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut ArchiveConfig, overrides: ConfigOverrides) -> Result<(), ConfigError> {
    if let Some(domain) = overrides.domain {
        config.server.domain = domain;
    }
    if let Some(path) = overrides.db_path {
        config.store.path = Some(PathBuf::from(path));
    }
    if let Some(path) = overrides.index_path {
        config.index.path = Some(PathBuf::from(path));
    }
    if let Some(flag) = overrides.message_archiving {
        config.archiving.messages = match flag.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "archiving.messages".to_string(),
                    message: format!("not a boolean: {flag}"),
                })
            }
        };
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    Ok(())
}

fn validate(config: &ArchiveConfig) -> Result<(), ConfigError> {
    if config.server.domain.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "server.domain".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if config.conversation.idle_time_minutes < 1 {
        return Err(ConfigError::InvalidValue {
            field: "conversation.idle_time_minutes".to_string(),
            message: "must be at least 1 minute".to_string(),
        });
    }
    if config.conversation.max_time_minutes < 1 {
        return Err(ConfigError::InvalidValue {
            field: "conversation.max_time_minutes".to_string(),
            message: "must be at least 1 minute".to_string(),
        });
    }
    if config.archiver.max_work_queue_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "archiver.max_work_queue_size".to_string(),
            message: "must be positive".to_string(),
        });
    }
    if config.archiver.max_purge_interval_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "archiver.max_purge_interval_ms".to_string(),
            message: "must be positive".to_string(),
        });
    }
    if config.query.workers == 0 {
        return Err(ConfigError::InvalidValue {
            field: "query.workers".to_string(),
            message: "must be positive".to_string(),
        });
    }
    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }
    for admin in &config.server.admins {
        if admin.parse::<BareJid>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "server.admins".to_string(),
                message: format!("not a bare JID: {admin}"),
            });
        }
    }
    Ok(())
}

impl ArchiveConfig {
    /// Log the effective archive configuration.
    pub fn log_config(&self) {
        info!("Archive domain: {}", self.server.domain);
        info!(
            "Metadata archiving: {}",
            if self.archiving.metadata_enabled() { "enabled" } else { "disabled" }
        );
        info!(
            "Message archiving: {}",
            if self.archiving.messages { "enabled" } else { "disabled" }
        );
        if self.archiving.rooms {
            if self.archiving.rooms_archived.is_empty() {
                info!("Room archiving: enabled for all rooms");
            } else {
                info!(
                    "Room archiving: enabled for {}",
                    self.archiving.rooms_archived.join(", ")
                );
            }
        } else {
            info!("Room archiving: disabled");
        }
        info!(
            "Private room messages: room archive {}, personal archive {}",
            if self.archiving.pm_in_room_archive { "on" } else { "off" },
            if self.archiving.pm_in_personal_archive { "on" } else { "off" }
        );
        if !self.archiving.empty_messages.is_empty() {
            info!("Empty message archiving: {:?}", self.archiving.empty_messages);
        }
        info!(
            "Conversation window: idle {} min, max {} min",
            self.conversation.idle_time_minutes, self.conversation.max_time_minutes
        );
        info!("Room backend: {:?}", self.store.room_backend);
        info!(
            "Full-text index: {}",
            if self.index.enabled { "enabled" } else { "disabled" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_without_env(toml_str: &str) -> Result<ArchiveConfig, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_without_env("").unwrap();
        assert!(config.archiving.metadata);
        assert!(!config.archiving.messages);
        assert!(!config.archiving.rooms);
        assert_eq!(config.conversation.idle_time_minutes, 10);
        assert_eq!(config.conversation.max_time_minutes, 60);
        assert_eq!(config.archiver.max_work_queue_size, 500);
        assert_eq!(config.archiver.max_purge_interval_ms, 1000);
        assert_eq!(config.archiver.grace_period_ms, 50);
        assert_eq!(config.query.default_max, 1000);
        assert_eq!(config.query.room_default_max, 100);
        assert!(config.query.force_rsm);
        assert!(!config.query.ignore_retrieval_exceptions);
        assert_eq!(config.store.room_backend, RoomBackend::Archive);
        assert!(config.conversation.max_age().is_none());
        assert!(config.archiving.pm_in_room_archive);
        assert!(!config.archiving.pm_in_personal_archive);
        assert!(config.archiving.empty_messages.is_empty());
    }

    #[test]
    fn empty_message_kinds_parse() {
        let config = parse_without_env(
            r#"
[archiving]
messages = true
empty_messages = ["displayed", "retraction", "receipt-received"]
"#,
        )
        .unwrap();
        assert!(config.archiving.archives_empty(EmptyMessageKind::Displayed));
        assert!(config.archiving.archives_empty(EmptyMessageKind::Retraction));
        assert!(config.archiving.archives_empty(EmptyMessageKind::ReceiptReceived));
        assert!(!config.archiving.archives_empty(EmptyMessageKind::Composing));

        let err = parse_without_env("[archiving]\nempty_messages = [\"typing\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidToml { .. }));
    }

    #[test]
    fn message_archiving_forces_metadata() {
        let config = parse_without_env(
            r#"
[archiving]
metadata = false
messages = true
"#,
        )
        .unwrap();
        assert!(config.archiving.metadata_enabled());
    }

    #[test]
    fn rooms_archived_restricts_by_node() {
        let config = parse_without_env(
            r#"
[archiving]
rooms = true
rooms_archived = ["lobby"]
"#,
        )
        .unwrap();
        let lobby: BareJid = "lobby@conference.example.com".parse().unwrap();
        let other: BareJid = "kitchen@conference.example.com".parse().unwrap();
        assert!(config.archiving.room_archived(&lobby));
        assert!(!config.archiving.room_archived(&other));
    }

    #[test]
    fn rejects_idle_time_below_one_minute() {
        let err = parse_without_env(
            r#"
[conversation]
idle_time_minutes = 0
"#,
        )
        .unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => {
                assert_eq!(field, "conversation.idle_time_minutes")
            }
            other => panic!("expected InvalidValue, got: {other}"),
        }
    }

    #[test]
    fn rejects_invalid_admin_jid() {
        let err = parse_without_env(
            r#"
[server]
admins = ["not a jid@@"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn invalid_toml_reports_position() {
        let err = parse_without_env("[archiving]\nmessages = maybe\n").unwrap_err();
        match err {
            ConfigError::InvalidToml { line, .. } => assert_eq!(line, 2),
            other => panic!("expected InvalidToml, got: {other}"),
        }
    }

    #[test]
    fn env_overrides_take_precedence() {
        let overrides = ConfigOverrides {
            domain: Some("override.example".to_string()),
            message_archiving: Some("on".to_string()),
            ..Default::default()
        };
        let config =
            load_config_from_str_with_overrides("[server]\ndomain = \"file.example\"\n", overrides)
                .unwrap();
        assert_eq!(config.server.domain, "override.example");
        assert!(config.archiving.messages);
    }

    #[test]
    fn local_domain_includes_subdomains() {
        let config = parse_without_env("[server]\ndomain = \"example.com\"\n").unwrap();
        let local: Jid = "user@example.com/phone".parse().unwrap();
        let room: Jid = "room@conference.example.com".parse().unwrap();
        let remote: Jid = "user@elsewhere.org".parse().unwrap();
        assert!(config.server.is_local(&local));
        assert!(config.server.is_local(&room));
        assert!(!config.server.is_local(&remote));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.toml");
        std::fs::write(&path, "[archiving]\nmessages = true\n").unwrap();

        let config = load_config_from(&path).unwrap();
        assert!(config.archiving.messages);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_from(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
