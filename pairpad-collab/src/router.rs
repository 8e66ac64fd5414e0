//! Best-effort fan-out of one envelope to a room's channels.
//!
//! A broadcast snapshots the room's membership, delivers outside the
//! registry lock, then evicts every channel that refused the frame. A
//! refused delivery is never retried and never stops the remaining
//! deliveries.
//!
//! `user_count` is the exception: its value is derived from the very
//! membership it is delivered to, so it is built and enqueued under the
//! registry's read guard. Any eviction is followed by a fresh count.
//!
//! ```text
//! Session ──► BroadcastRouter ──► snapshot(members)
//!                   │
//!                   ├── deliver ──► Channel A   ok
//!                   ├── deliver ──► Channel B   closed ──┐
//!                   └── deliver ──► Channel C   ok       │
//!                                                       ▼
//!                                          SessionRegistry::remove(B)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{Envelope, RoomId};
use crate::registry::{ChannelId, SessionRegistry};

/// Router counters, read via [`BroadcastRouter::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub deliveries: u64,
    pub evictions: u64,
}

struct AtomicRouterStats {
    messages_routed: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

impl AtomicRouterStats {
    fn new() -> Self {
        Self {
            messages_routed: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }
}

/// Fan-out over a shared [`SessionRegistry`].
#[derive(Clone)]
pub struct BroadcastRouter {
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicRouterStats>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(AtomicRouterStats::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Deliver to every member except `exclude` (the originator).
    pub async fn broadcast_except(&self, room_id: &RoomId, envelope: &Envelope, exclude: ChannelId) {
        self.fan_out(room_id, envelope, Some(exclude)).await;
    }

    /// Deliver to every member, originator included.
    pub async fn broadcast_all(&self, room_id: &RoomId, envelope: &Envelope) {
        self.fan_out(room_id, envelope, None).await;
    }

    /// Deliver `user_count` with the room's size to every member.
    ///
    /// Count and recipients come from one registry snapshot, so the last
    /// count each channel receives always matches the final membership.
    /// Returns the count last announced.
    pub async fn broadcast_count(&self, room_id: &RoomId) -> usize {
        loop {
            let (count, delivered, failed) = self
                .registry
                .with_members(room_id, |members| {
                    let count = members.len();
                    let mut failed = Vec::new();
                    let mut delivered = 0u64;
                    if count == 0 {
                        return (count, delivered, failed);
                    }
                    let frame = match Envelope::user_count(count).encode() {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::error!("Dropping user_count for room '{room_id}': {e}");
                            return (count, delivered, failed);
                        }
                    };
                    for channel in members {
                        match channel.deliver(frame.clone()) {
                            Ok(()) => delivered += 1,
                            Err(e) => {
                                log::warn!(
                                    "Delivery to channel {} in room '{room_id}' failed: {e}",
                                    channel.id()
                                );
                                failed.push(channel.id());
                            }
                        }
                    }
                    (count, delivered, failed)
                })
                .await;
            if count == 0 {
                return 0;
            }

            self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);
            self.stats.deliveries.fetch_add(delivered, Ordering::Relaxed);
            log::debug!("Announced user_count {count} to {delivered} channel(s) in room '{room_id}'");
            if failed.is_empty() {
                return count;
            }
            self.evict(room_id, failed).await;
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_routed: self.stats.messages_routed.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    async fn fan_out(&self, room_id: &RoomId, envelope: &Envelope, exclude: Option<ChannelId>) {
        let members = self.registry.members(room_id).await;
        if members.is_empty() {
            return;
        }

        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Dropping {} for room '{room_id}': {e}", envelope.message_type());
                return;
            }
        };
        self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);

        let mut failed = Vec::new();
        let mut delivered = 0u64;
        for channel in members.iter().filter(|c| Some(c.id()) != exclude) {
            match channel.deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Delivery to channel {} in room '{room_id}' failed: {e}", channel.id());
                    failed.push(channel.id());
                }
            }
        }
        self.stats.deliveries.fetch_add(delivered, Ordering::Relaxed);

        log::debug!(
            "Routed {} to {delivered} channel(s) in room '{room_id}'",
            envelope.message_type()
        );

        if !failed.is_empty() && self.evict(room_id, failed).await > 0 {
            self.broadcast_count(room_id).await;
        }
    }

    /// Remove refused channels; returns how many were still registered.
    async fn evict(&self, room_id: &RoomId, failed: Vec<ChannelId>) -> u64 {
        let mut evicted = 0;
        for channel_id in failed {
            if self.registry.remove(room_id, channel_id).await {
                evicted += 1;
            }
        }
        self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutputStatus;
    use crate::registry::Channel;
    use tokio::sync::mpsc;

    async fn joined(
        registry: &SessionRegistry,
        room: &RoomId,
    ) -> (Channel, mpsc::Receiver<crate::protocol::Frame>) {
        let (channel, rx) = Channel::new(16);
        registry.admit(room.clone(), channel.clone()).await;
        (channel, rx)
    }

    fn setup() -> (Arc<SessionRegistry>, BroadcastRouter, RoomId) {
        let registry = Arc::new(SessionRegistry::new());
        let router = BroadcastRouter::new(registry.clone());
        (registry, router, RoomId::from("abc12345"))
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_sender() {
        let (registry, router, room) = setup();
        let (alice, mut rx_a) = joined(&registry, &room).await;
        let (_bob, mut rx_b) = joined(&registry, &room).await;
        let (_carol, mut rx_c) = joined(&registry, &room).await;

        let msg = Envelope::code_update("y=2", 3);
        router.broadcast_except(&room, &msg, alice.id()).await;

        assert!(rx_a.try_recv().is_err());
        let frame = rx_b.try_recv().unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), msg);
        assert!(rx_c.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_all_includes_sender() {
        let (registry, router, room) = setup();
        let (_alice, mut rx_a) = joined(&registry, &room).await;
        let (_bob, mut rx_b) = joined(&registry, &room).await;

        let msg = Envelope::code_output(OutputStatus::Completed, Some("2\n".into()), None);
        router.broadcast_all(&room, &msg).await;

        assert_eq!(Envelope::decode(&rx_a.try_recv().unwrap()).unwrap(), msg);
        assert_eq!(Envelope::decode(&rx_b.try_recv().unwrap()).unwrap(), msg);
        assert_eq!(router.stats().deliveries, 2);
    }

    #[tokio::test]
    async fn test_failed_channel_evicted() {
        let (registry, router, room) = setup();
        let (_alice, mut rx_a) = joined(&registry, &room).await;
        let (dead, rx_dead) = joined(&registry, &room).await;
        let (_carol, mut rx_c) = joined(&registry, &room).await;
        drop(rx_dead);

        router.broadcast_all(&room, &Envelope::user_count(3)).await;

        // Survivors still got the frame; the dead channel is gone.
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        assert_eq!(registry.count(&room).await, 2);
        let ids: Vec<_> = registry.members(&room).await.iter().map(Channel::id).collect();
        assert!(!ids.contains(&dead.id()));
        assert_eq!(router.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_full_channel_evicted_without_retry() {
        let (registry, router, room) = setup();
        let (slow, mut rx_slow) = Channel::new(1);
        registry.admit(room.clone(), slow.clone()).await;
        let (sender, _rx_sender) = joined(&registry, &room).await;

        router.broadcast_except(&room, &Envelope::cursor_move(1), sender.id()).await;
        router.broadcast_except(&room, &Envelope::cursor_move(2), sender.id()).await;

        assert_eq!(registry.count(&room).await, 1);
        assert_eq!(
            Envelope::decode(&rx_slow.recv().await.unwrap()).unwrap(),
            Envelope::cursor_move(1)
        );
    }

    #[tokio::test]
    async fn test_last_member_failure_prunes_room() {
        let (registry, router, room) = setup();
        let (_only, rx) = joined(&registry, &room).await;
        drop(rx);

        router.broadcast_all(&room, &Envelope::user_count(1)).await;
        assert!(!registry.contains_room(&room).await);
    }

    #[tokio::test]
    async fn test_empty_room_is_noop() {
        let (_registry, router, room) = setup();
        router.broadcast_all(&room, &Envelope::user_count(0)).await;
        assert_eq!(router.stats(), RouterStats::default());
    }

    #[tokio::test]
    async fn test_broadcast_count_reflects_membership() {
        let (registry, router, room) = setup();
        let (_alice, mut rx_a) = joined(&registry, &room).await;
        let (_bob, mut rx_b) = joined(&registry, &room).await;

        assert_eq!(router.broadcast_count(&room).await, 2);
        assert_eq!(Envelope::decode(&rx_a.try_recv().unwrap()).unwrap(), Envelope::user_count(2));
        assert_eq!(Envelope::decode(&rx_b.try_recv().unwrap()).unwrap(), Envelope::user_count(2));
        assert_eq!(router.broadcast_count(&RoomId::from("empty")).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_count_reannounces_after_eviction() {
        let (registry, router, room) = setup();
        let (_alice, mut rx_a) = joined(&registry, &room).await;
        let (_dead, rx_dead) = joined(&registry, &room).await;
        drop(rx_dead);

        assert_eq!(router.broadcast_count(&room).await, 1);
        let counts: Vec<_> = std::iter::from_fn(|| rx_a.try_recv().ok())
            .map(|frame| Envelope::decode(&frame).unwrap())
            .collect();
        assert_eq!(counts, vec![Envelope::user_count(2), Envelope::user_count(1)]);
        assert_eq!(router.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_relay_eviction_updates_count() {
        let (registry, router, room) = setup();
        let (alice, _rx_a) = joined(&registry, &room).await;
        let (_bob, mut rx_b) = joined(&registry, &room).await;
        let (_dead, rx_dead) = joined(&registry, &room).await;
        drop(rx_dead);

        router.broadcast_except(&room, &Envelope::cursor_move(4), alice.id()).await;
        assert_eq!(Envelope::decode(&rx_b.try_recv().unwrap()).unwrap(), Envelope::cursor_move(4));
        assert_eq!(Envelope::decode(&rx_b.try_recv().unwrap()).unwrap(), Envelope::user_count(2));
    }

    #[tokio::test]
    async fn test_rooms_do_not_leak() {
        let (registry, router, room) = setup();
        let other = RoomId::from("other");
        let (_a, mut rx_a) = joined(&registry, &room).await;
        let (_b, mut rx_b) = joined(&registry, &other).await;

        router.broadcast_all(&other, &Envelope::user_count(1)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }
}
