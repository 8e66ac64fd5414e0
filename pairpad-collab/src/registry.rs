//! Per-room connection registry.
//!
//! Maps a room id to the set of live channels currently joined to it.
//! A room entry exists if and only if it has at least one member; the
//! entry is dropped the moment its last member leaves.
//!
//! All mutations go through a single `RwLock` over the whole map, so a
//! completed `admit`/`remove` is always reflected in `count`. The lock is
//! never held across an `.await` on I/O.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Frame, RoomId};

/// Stable identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a frame could not be handed to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Outbound buffer is full (the client is not draining).
    #[error("channel buffer full")]
    Full,
    /// The connection task has gone away.
    #[error("channel closed")]
    Closed,
}

/// Send-capable handle to one connection's outbound queue.
///
/// Cloning is cheap; every clone feeds the same queue.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    tx: mpsc::Sender<Frame>,
}

impl Channel {
    /// Create a channel with a bounded outbound buffer.
    ///
    /// The receiver is drained by the connection's writer; once every
    /// `Channel` clone is dropped the receiver yields `None`.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ChannelId::new(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Enqueue a frame without waiting.
    pub fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receipt returned by [`SessionRegistry::admit`].
#[derive(Debug, Clone)]
pub struct Membership {
    pub room_id: RoomId,
    pub channel_id: ChannelId,
    pub joined_at: Instant,
}

struct Member {
    channel: Channel,
    joined_at: Instant,
}

/// Room → live channels. Construct once and share behind an `Arc`.
#[derive(Default)]
pub struct SessionRegistry {
    rooms: RwLock<HashMap<RoomId, HashMap<ChannelId, Member>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` under `room_id`, creating the room entry on first member.
    ///
    /// Callers admit each channel at most once.
    pub async fn admit(&self, room_id: RoomId, channel: Channel) -> Membership {
        let joined_at = Instant::now();
        let channel_id = channel.id();

        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room_id.clone()).or_default();
        members.insert(channel_id, Member { channel, joined_at });
        log::info!(
            "Channel {channel_id} admitted to room '{room_id}' | Total: {}",
            members.len()
        );

        Membership {
            room_id,
            channel_id,
            joined_at,
        }
    }

    /// Unregister a channel. Returns `false` if it was already gone.
    pub async fn remove(&self, room_id: &RoomId, channel_id: ChannelId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(room_id) else {
            return false;
        };
        let Some(member) = members.remove(&channel_id) else {
            return false;
        };

        log::info!(
            "Channel {channel_id} left room '{room_id}' after {:?} | Remaining: {}",
            member.joined_at.elapsed(),
            members.len()
        );
        if members.is_empty() {
            rooms.remove(room_id);
            log::info!("Room '{room_id}' is now empty, entry pruned");
        }
        true
    }

    /// Live member count; 0 for unknown rooms.
    pub async fn count(&self, room_id: &RoomId) -> usize {
        self.rooms.read().await.get(room_id).map_or(0, HashMap::len)
    }

    /// Snapshot of the room's channels for fan-out.
    pub async fn members(&self, room_id: &RoomId) -> Vec<Channel> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|members| members.values().map(|m| m.channel.clone()).collect())
            .unwrap_or_default()
    }

    /// Run `f` over the room's channels while holding the read guard.
    ///
    /// No admit or remove can interleave, so `members.len()` inside `f` is
    /// exactly the set `f` sees. `f` must not block.
    pub async fn with_members<R>(&self, room_id: &RoomId, f: impl FnOnce(&[&Channel]) -> R) -> R {
        let rooms = self.rooms.read().await;
        let members: Vec<&Channel> = rooms
            .get(room_id)
            .map(|members| members.values().map(|m| &m.channel).collect())
            .unwrap_or_default();
        f(&members)
    }

    /// Whether `channel_id` is still a member of `room_id`.
    pub async fn contains(&self, room_id: &RoomId, channel_id: ChannelId) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .is_some_and(|members| members.contains_key(&channel_id))
    }

    pub async fn contains_room(&self, room_id: &RoomId) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
