//! Per-connection protocol state machine.
//!
//! ```text
//!   Connecting ──room missing──► Closed (4004 "room not found")
//!       │
//!       │ room exists
//!       ▼
//!    Joined ──admit, init, user_count──► Streaming ◄──┐
//!                                          │  │       │ code_update / cursor_move /
//!                                          │  └───────┘ code_output / ignored
//!                                          │
//!                                          │ disconnect / read error
//!                                          ▼
//!                                       Closed ──remove, user_count
//! ```
//!
//! The only admission check is that the room exists; the room id is the
//! capability. `Session::close` consumes the session, so nothing can be
//! sent or received for a channel after it closes. A channel the router
//! has evicted is treated the same way: its frames are dropped.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{Envelope, IgnoreReason, Inbound, RoomId};
use crate::registry::{Channel, ChannelId, SessionRegistry};
use crate::router::BroadcastRouter;
use crate::storage::{RoomStore, StoreError};

/// Lifecycle stage of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Streaming,
    Closed,
}

/// Shared collaborators handed to every connection.
#[derive(Clone)]
pub struct SessionContext {
    registry: Arc<SessionRegistry>,
    router: BroadcastRouter,
    store: Arc<dyn RoomStore>,
}

impl SessionContext {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn RoomStore>) -> Self {
        let router = BroadcastRouter::new(registry.clone());
        Self {
            registry,
            router,
            store,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }
}

/// Admission failures. Each maps to a distinguished close frame.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room '{0}' not found")]
    RoomNotFound(RoomId),
    #[error("room lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// What the machine did with one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Relayed to everyone but the sender.
    RelayedToOthers,
    /// Relayed to the whole room, sender included.
    RelayedToAll,
    Ignored(IgnoreReason),
    /// The channel was evicted; nothing was relayed or persisted.
    Evicted,
}

/// A channel that passed admission and is streaming.
pub struct Session {
    ctx: SessionContext,
    room_id: RoomId,
    channel_id: ChannelId,
    state: SessionState,
}

impl Session {
    /// Run `Connecting → Joined → Streaming` for a freshly opened channel.
    ///
    /// On a missing room nothing touches the registry. Otherwise the channel
    /// receives exactly one `init` as its first frame and the whole room
    /// gets a fresh `user_count`.
    pub async fn join(
        ctx: &SessionContext,
        room_id: RoomId,
        channel: Channel,
    ) -> Result<Session, SessionError> {
        let room = match ctx.store.get(&room_id)? {
            Some(room) => room,
            None => {
                log::warn!("Connection rejected, room '{room_id}' not found");
                return Err(SessionError::RoomNotFound(room_id));
            }
        };

        let channel_id = channel.id();
        let mut session = Session {
            ctx: ctx.clone(),
            room_id: room_id.clone(),
            channel_id,
            state: SessionState::Connecting,
        };
        session.transition(SessionState::Joined);

        // Queue the snapshot before admission so no relay can overtake it.
        let init = Envelope::init(room_id.clone(), room.code, room.language);
        match init.encode() {
            Ok(frame) => {
                if let Err(e) = channel.deliver(frame) {
                    log::warn!("Could not queue init for channel {channel_id}: {e}");
                }
            }
            Err(e) => log::error!("Could not encode init for room '{room_id}': {e}"),
        }
        ctx.registry.admit(room_id, channel).await;

        session.transition(SessionState::Streaming);
        session.announce_count().await;
        Ok(session)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the router still counts this channel as a room member.
    pub async fn is_member(&self) -> bool {
        self.ctx.registry.contains(&self.room_id, self.channel_id).await
    }

    /// Validate and dispatch one raw text frame.
    pub async fn handle_text(&mut self, text: &str) -> Dispatch {
        if !self.is_member().await {
            return Dispatch::Evicted;
        }
        match Envelope::parse_inbound(text) {
            Inbound::Envelope(envelope) => self.dispatch(envelope).await,
            Inbound::Ignored(reason) => {
                log::warn!(
                    "Ignoring frame from channel {} in room '{}': {reason}",
                    self.channel_id,
                    self.room_id
                );
                Dispatch::Ignored(reason)
            }
        }
    }

    /// Dispatch one validated envelope.
    pub async fn handle(&mut self, envelope: Envelope) -> Dispatch {
        if !self.is_member().await {
            return Dispatch::Evicted;
        }
        self.dispatch(envelope).await
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Dispatch {
        match envelope {
            Envelope::CodeUpdate { ref code, .. } => {
                self.persist_code(code);
                self.ctx
                    .router
                    .broadcast_except(&self.room_id, &envelope, self.channel_id)
                    .await;
                log::debug!(
                    "Code updated in room '{}' | Length: {} chars",
                    self.room_id,
                    code.chars().count()
                );
                Dispatch::RelayedToOthers
            }
            Envelope::CursorMove { .. } => {
                self.ctx
                    .router
                    .broadcast_except(&self.room_id, &envelope, self.channel_id)
                    .await;
                Dispatch::RelayedToOthers
            }
            Envelope::CodeOutput { status, .. } => {
                self.ctx.router.broadcast_all(&self.room_id, &envelope).await;
                log::info!("Code output ({status:?}) broadcast in room '{}'", self.room_id);
                Dispatch::RelayedToAll
            }
            other => Dispatch::Ignored(IgnoreReason::ServerOnly(other.message_type())),
        }
    }

    /// `Streaming → Closed`: leave the registry and announce the new count.
    pub async fn close(mut self) {
        self.ctx.registry.remove(&self.room_id, self.channel_id).await;
        self.transition(SessionState::Closed);
        self.announce_count().await;
        log::info!("Channel {} closed in room '{}'", self.channel_id, self.room_id);
    }

    fn transition(&mut self, next: SessionState) {
        log::trace!(
            "Channel {} in room '{}': {:?} -> {next:?}",
            self.channel_id,
            self.room_id,
            self.state
        );
        self.state = next;
    }

    async fn announce_count(&self) {
        self.ctx.router.broadcast_count(&self.room_id).await;
    }

    /// Persistence failures never stop the relay.
    fn persist_code(&self, code: &str) {
        match self.ctx.store.set_code(&self.room_id, code) {
            Ok(true) => {}
            Ok(false) => log::warn!("Room '{}' vanished before code could be saved", self.room_id),
            Err(e) => log::error!("Failed to persist code for room '{}': {e}", self.room_id),
        }
    }
}
