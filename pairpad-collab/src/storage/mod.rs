//! Durable room records: the authoritative code buffer for each room.
//!
//! ```text
//! ┌─────────────┐  get / set_code   ┌──────────────────┐
//! │  Session    │ ────────────────► │ dyn RoomStore    │
//! │  (per conn) │                   ├──────────────────┤
//! └─────────────┘                   │ MemoryRoomStore  │  tests, ephemeral runs
//!                                   │ RocksRoomStore   │  CF "rooms" + CF "code"
//!                                   └──────────────────┘
//! ```
//!
//! The session layer never caches a room's code; it reads once on join
//! and writes on every `code_update` (last writer wins).

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::RoomId;

pub use memory::MemoryRoomStore;
pub use rocks::{RocksRoomStore, StoreConfig};

/// Buffer contents for a freshly created room.
pub const DEFAULT_CODE: &str = "# Welcome! Start coding here...\n";
pub const DEFAULT_LANGUAGE: &str = "python";

/// One collaborative room as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    pub code: String,
    /// Display/highlighting hint.
    pub language: String,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl Room {
    pub fn new(room_id: RoomId, language: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            room_id,
            code: DEFAULT_CODE.to_string(),
            language: language.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Room store contract consumed by the session layer.
///
/// `get` reports a missing room as `Ok(None)`. `set_code` returns `false`
/// when the room no longer exists. Implementations serialize their own
/// writes.
pub trait RoomStore: Send + Sync {
    /// Create a room with a fresh id and the default buffer.
    fn create(&self, language: &str) -> Result<Room, StoreError>;

    fn get(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError>;

    /// Replace the room's code wholesale.
    fn set_code(&self, room_id: &RoomId, code: &str) -> Result<bool, StoreError>;

    fn list_rooms(&self) -> Result<Vec<RoomId>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Could not allocate a unique room id")]
    IdExhausted,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Attempts at drawing an unused room id before giving up.
pub(crate) const MAX_ID_ATTEMPTS: usize = 16;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
