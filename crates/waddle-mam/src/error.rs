//! Error types for the message archive.

use thiserror::Error;

use crate::store::StoreError;

/// Stanza errors namespace (RFC 6120).
pub const STANZAS_NS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Message archive errors.
#[derive(Debug, Error)]
pub enum MamError {
    /// Failure reported by the archive store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A cursor token does not reference a message in the addressed archive
    #[error("Reference not found: {0}")]
    NotFound(String),

    /// The store or the index failed while answering a query
    #[error("Data retrieval failed: {0}")]
    DataRetrieval(String),

    /// Full-text index failure
    #[error("Index error: {0}")]
    Index(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A message without a persisted internal id was handed to the renderer
    #[error("Archived message has no internal identifier")]
    MissingIdentifier,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error (for IQ error responses)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl MamError {
    /// Create a new reference-not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new data retrieval error.
    pub fn data_retrieval(msg: impl Into<String>) -> Self {
        Self::DataRetrieval(msg.into())
    }

    /// Create a new index error.
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// Create a stanza error for 'item-not-found'.
    pub fn item_not_found(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ItemNotFound,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'feature-not-implemented'.
    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::FeatureNotImplemented,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::Forbidden,
            error_type: StanzaErrorType::Auth,
            text,
        }
    }

    /// Create a stanza error for 'internal-server-error'.
    pub fn internal_server_error(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::InternalServerError,
            error_type: StanzaErrorType::Wait,
            text,
        }
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ServiceUnavailable,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Whether this error reports an unresolvable cursor.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Stanza {
                    condition: StanzaErrorCondition::ItemNotFound,
                    ..
                }
        )
    }

    /// The stanza error condition reported to the requesting entity.
    ///
    /// Unresolvable references surface as item-not-found; everything that is not
    /// already a stanza error is reported as internal-server-error.
    pub fn condition(&self) -> (StanzaErrorCondition, StanzaErrorType) {
        match self {
            Self::NotFound(_) => (StanzaErrorCondition::ItemNotFound, StanzaErrorType::Cancel),
            Self::Stanza {
                condition,
                error_type,
                ..
            } => (*condition, *error_type),
            _ => (
                StanzaErrorCondition::InternalServerError,
                StanzaErrorType::Wait,
            ),
        }
    }

    /// Human readable text attached to the error element, if any.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Stanza { text, .. } => text.clone(),
            Self::NotFound(msg) => Some(msg.clone()),
            _ => None,
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3) used by the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed form, unsupported field)
    BadRequest,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// Service unavailable
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate an IQ error response for a failed archive request.
pub fn generate_iq_error(id: &str, to: Option<&str>, from: Option<&str>, error: &MamError) -> String {
    let (condition, error_type) = error.condition();
    let mut iq = format!("<iq type='error' id='{}'", escape(id));

    if let Some(to) = to {
        iq.push_str(&format!(" to='{}'", escape(to)));
    }

    if let Some(from) = from {
        iq.push_str(&format!(" from='{}'", escape(from)));
    }

    iq.push_str(&format!(
        "><error type='{}'><{} xmlns='{}'/>{}</error></iq>",
        error_type.as_str(),
        condition.as_str(),
        STANZAS_NS,
        error
            .text()
            .map(|t| format!(
                "<text xmlns='{}' xml:lang='en'>{}</text>",
                STANZAS_NS,
                escape(&t)
            ))
            .unwrap_or_default()
    ));

    iq
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}
