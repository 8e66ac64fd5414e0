//! # pairpad-collab: Real-time room sync for the PairPad editor
//!
//! Every browser tab editing a room holds one WebSocket. The server keeps
//! no document model: the last `code_update` wins, and it is relayed to the
//! other members and written through to the room store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON envelopes   ┌──────────────┐
//! │ Browser tab │ ◄────────────────► │ CollabServer │
//! │ (per user)  │   /ws/{roomId}     │  (central)   │
//! └─────────────┘                    └──────┬───────┘
//!                                           │ one Session per socket
//!                    ┌──────────────────────┼──────────────────────┐
//!                    ▼                      ▼                      ▼
//!            ┌──────────────┐      ┌─────────────────┐     ┌─────────────────┐
//!            │ RoomStore    │      │ BroadcastRouter │     │ SessionRegistry │
//!            │ memory/Rocks │      │ (fan-out)       │ ──► │ room → channels │
//!            └──────────────┘      └─────────────────┘     └────────┬────────┘
//!                                                                   │ bounded Channel
//!                                                                   ▼
//!                                                             peers' sockets
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes and inbound validation
//! - [`registry`]: room → live channel membership
//! - [`router`]: fan-out with eviction of failed channels
//! - [`session`]: per-connection state machine
//! - [`server`]: WebSocket accept loop
//! - [`storage`]: room records (in-memory or RocksDB)
//! - [`executor`]: sandboxed code runs for the output panel
//! - [`autocomplete`]: pattern-table suggestions
//! - [`config`]: environment-driven server configuration

pub mod autocomplete;
pub mod config;
pub mod executor;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use autocomplete::{suggest, Suggestion};
pub use config::{ConfigError, ServerConfig};
pub use executor::{CodeExecutor, ExecutionResult, ExecutorConfig, ExecutorError, Runtime};
pub use protocol::{
    Envelope, Frame, IgnoreReason, Inbound, MessageType, OutputStatus, ProtocolError, RoomId,
};
pub use registry::{Channel, ChannelId, DeliveryError, Membership, SessionRegistry};
pub use router::{BroadcastRouter, RouterStats};
pub use server::{CollabServer, ServerError, ServerStats};
pub use session::{Dispatch, Session, SessionContext, SessionError, SessionState};
pub use storage::{
    MemoryRoomStore, RocksRoomStore, Room, RoomStore, StoreConfig, StoreError,
};
