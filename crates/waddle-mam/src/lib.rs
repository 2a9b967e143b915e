//! # waddle-mam
//!
//! XEP-0313 Message Archive Management for Waddle Social.
//!
//! ## Architecture
//!
//! - **Conversation windowing**: groups one-to-one and room traffic into
//!   conversations bounded by an idle time and a maximum duration
//! - **Archivers**: batch writers that persist conversations, participations
//!   and messages off the delivery path
//! - **Availability gate**: holds a query until writes queued before it are durable
//! - **Query engine**: RSM-paginated retrieval over the archive tables, the
//!   host's room log or the full-text index
//! - **IQ handler**: the `urn:xmpp:mam:2` surface (query, form and metadata)
//!
//! ## XEP Support
//!
//! - XEP-0059 (Result Set Management)
//! - XEP-0313 (Message Archive Management)
//! - XEP-0359 (Unique and Stable Stanza IDs)
//! - XEP-0431 (Full Text Search in MAM)

pub mod archiver;
pub mod config;
pub mod conversation;
pub mod gate;
pub mod handler;
pub mod identifier;
pub mod index;
pub mod metrics;
pub mod query;
pub mod sequence;
pub mod service;
pub mod store;

mod error;
mod types;

pub use config::{load_config_from, load_config_from_str, load_default_config, ArchiveConfig};
pub use error::{generate_iq_error, MamError, StanzaErrorCondition, StanzaErrorType};
pub use handler::{MamHandler, Outbound};
pub use query::{QueryEngine, QueryPage, QueryRequest};
pub use service::MonitoringService;
pub use types::*;
