//! Cluster hand-off of conversation events.
//!
//! Only the node that owns conversation tracking applies events. Every other
//! node forwards them over a channel to the owner. Which node owns tracking is
//! decided elsewhere; the router is promoted or demoted accordingly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConversationManager, MessageEvent, RoomMessageEvent};
use crate::error::MamError;

/// Input to the windowing engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Message(MessageEvent),
    RoomMessage(RoomMessageEvent),
    OccupantJoined {
        room: BareJid,
        user: Jid,
        nickname: String,
        at: DateTime<Utc>,
    },
    OccupantLeft {
        room: BareJid,
        user: Jid,
        at: DateTime<Utc>,
    },
    NicknameChanged {
        room: BareJid,
        user: Jid,
        nickname: String,
        at: DateTime<Utc>,
    },
    RoomDestroyed {
        room: BareJid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterRole {
    /// Applies events to the local manager
    Owner,
    /// Forwards events to the owner
    Follower,
}

pub struct ConversationRouter {
    manager: Arc<ConversationManager>,
    owner: AtomicBool,
    outbound: mpsc::Sender<ConversationEvent>,
}

impl ConversationRouter {
    pub fn new(
        manager: Arc<ConversationManager>,
        role: RouterRole,
        outbound: mpsc::Sender<ConversationEvent>,
    ) -> Self {
        Self {
            manager,
            owner: AtomicBool::new(role == RouterRole::Owner),
            outbound,
        }
    }

    pub fn role(&self) -> RouterRole {
        if self.owner.load(Ordering::Acquire) {
            RouterRole::Owner
        } else {
            RouterRole::Follower
        }
    }

    pub fn promote(&self) {
        if !self.owner.swap(true, Ordering::AcqRel) {
            info!("Now tracking conversations on this node");
        }
    }

    pub fn demote(&self) {
        if self.owner.swap(false, Ordering::AcqRel) {
            info!("Conversation tracking handed to another node");
        }
    }

    /// Apply an event locally or forward it to the owner.
    pub fn route(&self, event: ConversationEvent) -> Result<(), MamError> {
        match self.role() {
            RouterRole::Owner => {
                self.apply(event);
                Ok(())
            }
            RouterRole::Follower => self.outbound.try_send(event).map_err(|e| {
                warn!(error = %e, "Unable to forward conversation event");
                MamError::internal(format!("Conversation event not forwarded: {}", e))
            }),
        }
    }

    /// Apply an event to the local manager.
    pub fn apply(&self, event: ConversationEvent) {
        match event {
            ConversationEvent::Message(message) => {
                self.manager.process_message(&message);
            }
            ConversationEvent::RoomMessage(message) => {
                self.manager.process_room_message(&message);
            }
            ConversationEvent::OccupantJoined {
                room,
                user,
                nickname,
                at,
            } => self.manager.occupant_joined(&room, &user, &nickname, at),
            ConversationEvent::OccupantLeft { room, user, at } => {
                self.manager.occupant_left(&room, &user, at)
            }
            ConversationEvent::NicknameChanged {
                room,
                user,
                nickname,
                at,
            } => self.manager.nickname_changed(&room, &user, &nickname, at),
            ConversationEvent::RoomDestroyed { room } => self.manager.room_destroyed(&room),
        }
    }

    /// Apply events forwarded by other nodes until cancelled.
    pub fn spawn_inbound(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<ConversationEvent>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = inbound.recv() => match event {
                        Some(event) if router.role() == RouterRole::Owner => router.apply(event),
                        Some(_) => debug!("Dropping forwarded event, not the owner"),
                        None => break,
                    }
                }
            }
        })
    }
}
