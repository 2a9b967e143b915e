//! XEP-0313 IQ handling.
//!
//! Queries are parsed and authorised, then wait at the availability gate and
//! run on a bounded pool. Results stream back as `<result/>` messages followed
//! by the `<fin/>` IQ.

mod access;
mod request;
mod response;

use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::Message;

use crate::config::ArchiveConfig;
use crate::error::{generate_iq_error, MamError};
use crate::gate::AvailabilityGate;
use crate::identifier::StableIdResolver;
use crate::query::{QueryEngine, QueryPage, QueryRequest};
use crate::store::Scope;

pub use access::{
    authorize_personal, authorize_room, Affiliation, NoRooms, Role, RoomDirectory, RoomInfo,
};
pub use request::{parse_query, ParsedQuery, SUPPORTED_FIELDS};
pub use response::{build_fin_iq, build_form_iq, build_metadata_iq, build_result_message};

/// MAM XML namespace (XEP-0313 v2).
pub const MAM_NS: &str = "urn:xmpp:mam:2";

/// The earlier MAM namespace, still used by older clients.
pub const MAM_V1_NS: &str = "urn:xmpp:mam:1";

/// Result Set Management namespace (XEP-0059).
pub const RSM_NS: &str = "http://jabber.org/protocol/rsm";

/// Data Forms namespace.
pub const DATA_FORMS_NS: &str = "jabber:x:data";

/// Forward namespace (XEP-0297).
pub const FORWARD_NS: &str = "urn:xmpp:forward:0";

/// Delay namespace (XEP-0203).
pub const DELAY_NS: &str = "urn:xmpp:delay";

/// Full-text search namespace (XEP-0431).
pub const FULLTEXT_NS: &str = "urn:xmpp:fulltext:0";

/// The form field carrying full-text search terms.
pub const FULLTEXT_FIELD: &str = "{urn:xmpp:fulltext:0}fulltext";

/// A stanza to deliver to the requesting entity.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(Message),
    Iq(Iq),
    /// A rendered `<iq type='error'/>`
    Error(String),
}

impl Outbound {
    pub fn to_xml(&self) -> String {
        match self {
            Outbound::Message(msg) => String::from(&Element::from(msg.clone())),
            Outbound::Iq(iq) => String::from(&Element::from(iq.clone())),
            Outbound::Error(xml) => xml.clone(),
        }
    }
}

/// Protocol version of a MAM request, told apart by namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MamVersion {
    V1,
    V2,
}

impl MamVersion {
    pub fn of(elem: &Element) -> Option<Self> {
        match elem.ns().as_str() {
            MAM_V1_NS => Some(MamVersion::V1),
            MAM_NS => Some(MamVersion::V2),
            _ => None,
        }
    }

    pub fn ns(self) -> &'static str {
        match self {
            MamVersion::V1 => MAM_V1_NS,
            MamVersion::V2 => MAM_NS,
        }
    }

    /// mam:1 results are identified by archive id only.
    pub fn stable_ids(self) -> bool {
        self == MamVersion::V2
    }
}

/// Check if an IQ carries a MAM query or metadata request.
pub fn is_mam_iq(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Set(elem) | IqType::Get(elem) => MamVersion::of(elem).is_some(),
        _ => false,
    }
}

/// Which archive an IQ addresses.
enum Target {
    Personal(BareJid),
    Room(RoomInfo),
}

pub struct MamHandler {
    config: Arc<ArchiveConfig>,
    engine: Arc<QueryEngine>,
    gate: Arc<AvailabilityGate>,
    rooms: Arc<dyn RoomDirectory>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    fulltext: bool,
}

impl MamHandler {
    pub fn new(
        config: Arc<ArchiveConfig>,
        engine: Arc<QueryEngine>,
        gate: Arc<AvailabilityGate>,
        rooms: Arc<dyn RoomDirectory>,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.query.workers));
        let fulltext = config.index.enabled;
        Self {
            config,
            engine,
            gate,
            rooms,
            permits,
            shutdown,
            fulltext,
        }
    }

    /// Features to advertise in service discovery.
    pub fn features(&self) -> Vec<&'static str> {
        let mut features = vec![MAM_V1_NS, MAM_NS];
        if self.fulltext {
            features.push(FULLTEXT_NS);
        }
        features
    }

    /// Process `iq` on the query pool and send every response stanza to
    /// `responses`.
    pub fn submit(self: &Arc<Self>, iq: Iq, responses: mpsc::Sender<Outbound>) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = handler.permits.clone().acquire_owned().await else {
                warn!("Query pool closed, dropping archive request");
                return;
            };
            for stanza in handler.handle(iq).await {
                if responses.send(stanza).await.is_err() {
                    debug!("Requestor went away, dropping remaining results");
                    break;
                }
            }
        })
    }

    /// Answer an IQ with the stanzas to send back, errors included.
    #[instrument(skip(self, iq), fields(id = %iq.id))]
    pub async fn handle(&self, iq: Iq) -> Vec<Outbound> {
        match self.dispatch(&iq).await {
            Ok(stanzas) => stanzas,
            Err(e) => {
                debug!(error = %e, "Archive request failed");
                let to = iq.from.as_ref().map(|j| j.to_string());
                let from = iq.to.as_ref().map(|j| j.to_string());
                vec![Outbound::Error(generate_iq_error(
                    &iq.id,
                    to.as_deref(),
                    from.as_deref(),
                    &e,
                ))]
            }
        }
    }

    async fn dispatch(&self, iq: &Iq) -> Result<Vec<Outbound>, MamError> {
        let requestor = iq
            .from
            .clone()
            .ok_or_else(|| MamError::bad_request(Some("Missing sender".to_string())))?;

        let (IqType::Get(elem) | IqType::Set(elem)) = &iq.payload else {
            return Err(MamError::service_unavailable(None));
        };
        let Some(version) = MamVersion::of(elem) else {
            return Err(MamError::service_unavailable(None));
        };

        match (&iq.payload, elem.name()) {
            (IqType::Get(_), "query") => Ok(vec![Outbound::Iq(build_form_iq(
                version.ns(),
                iq,
                self.fulltext,
            ))]),
            (IqType::Get(_), "metadata") if version == MamVersion::V2 => {
                self.metadata(iq, &requestor).await
            }
            (IqType::Set(_), "query") => self.query(iq, elem, &requestor, version).await,
            _ => Err(MamError::service_unavailable(None)),
        }
    }

    async fn target(&self, iq: &Iq, requestor: &Jid) -> Result<Target, MamError> {
        let archive = iq
            .to
            .as_ref()
            .map(|to| to.to_bare())
            .unwrap_or_else(|| requestor.to_bare());

        if archive.domain().as_str() == self.config.server.domain {
            return Ok(Target::Personal(archive));
        }
        match self.rooms.room(&archive).await {
            Some(room) => Ok(Target::Room(room)),
            None => Err(MamError::item_not_found(Some(format!(
                "The archive '{}' cannot be found or is not accessible",
                archive
            )))),
        }
    }

    async fn query(
        &self,
        iq: &Iq,
        elem: &Element,
        requestor: &Jid,
        version: MamVersion,
    ) -> Result<Vec<Outbound>, MamError> {
        let target = self.target(iq, requestor).await?;
        let parsed = parse_query(elem, self.config.query.allow_unrecognized_fields)?;
        let use_stable_ids = self.config.query.use_stable_ids && version.stable_ids();

        let (archive, room) = match &target {
            Target::Personal(owner) => {
                authorize_personal(&self.config.server, owner, requestor)?;
                (owner.clone(), None)
            }
            Target::Room(info) => {
                authorize_room(
                    &self.config.server,
                    self.rooms.as_ref(),
                    info,
                    requestor,
                    parsed.with.as_ref(),
                )
                .await?;
                (info.jid.clone(), Some(info))
            }
        };

        let outcome = self.gate.wait(&self.shutdown.child_token()).await;
        if outcome.possibly_incomplete() {
            info!(archive = %archive, "Answering archive query with possibly incomplete data");
        }

        let page = match room {
            Some(info) if !info.logging => {
                debug!(room = %info.jid, "Room logging is disabled, answering with no results");
                QueryPage::empty(0)
            }
            _ => {
                let mut request = self.request_for(&archive, room.is_some(), requestor, &parsed);
                request.use_stable_ids = use_stable_ids;
                self.engine.find_messages(&request).await?
            }
        };

        let mut stanzas = Vec::with_capacity(page.messages.len() + 1);
        for message in &page.messages {
            let result_id = StableIdResolver::render(message, &archive, use_stable_ids)?;
            match build_result_message(
                version.ns(),
                parsed.query_id.as_deref(),
                requestor,
                message,
                &result_id,
                room.map(|info| &info.jid),
            ) {
                Some(result) => stanzas.push(Outbound::Message(result)),
                None => warn!(id = %result_id, "Archived message has neither stanza nor body"),
            }
        }
        stanzas.push(Outbound::Iq(build_fin_iq(
            version.ns(),
            iq,
            parsed.query_id.as_deref(),
            &page,
        )));

        debug!(
            archive = %archive,
            results = page.messages.len(),
            complete = page.complete,
            "Archive query done"
        );
        Ok(stanzas)
    }

    fn request_for(
        &self,
        archive: &BareJid,
        room: bool,
        requestor: &Jid,
        parsed: &ParsedQuery,
    ) -> QueryRequest {
        let mut request = if room {
            QueryRequest::room(archive.clone(), requestor.to_bare())
        } else {
            QueryRequest::personal(archive.clone())
        };
        request.with = parsed.with.clone();
        request.start = parsed.start;
        request.end = parsed.end;
        request.text = parsed.text.clone();
        request.after = parsed.after.clone();
        request.before = parsed.before.clone();
        request.max = parsed.max;
        request.backwards = parsed.backwards;
        request.use_stable_ids = self.config.query.use_stable_ids;
        if !self.config.query.force_rsm && request.max.is_none() {
            request.max = Some(i64::from(u32::MAX));
        }
        request
    }

    async fn metadata(&self, iq: &Iq, requestor: &Jid) -> Result<Vec<Outbound>, MamError> {
        let target = self.target(iq, requestor).await?;
        let (archive, scope) = match &target {
            Target::Personal(owner) => {
                authorize_personal(&self.config.server, owner, requestor)?;
                (
                    owner.clone(),
                    Scope::Personal {
                        owner: owner.clone(),
                    },
                )
            }
            Target::Room(info) => {
                authorize_room(&self.config.server, self.rooms.as_ref(), info, requestor, None)
                    .await?;
                (
                    info.jid.clone(),
                    Scope::Room {
                        room: info.jid.clone(),
                        message_owner: requestor.to_bare(),
                    },
                )
            }
        };

        self.gate.wait(&self.shutdown.child_token()).await;
        let metadata = self.engine.metadata(&archive, &scope).await?;
        Ok(vec![Outbound::Iq(build_metadata_iq(iq, metadata.as_ref()))])
    }
}
