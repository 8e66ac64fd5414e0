//! In-process room store.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{unix_now, Room, RoomStore, StoreError, MAX_ID_ATTEMPTS};
use crate::protocol::RoomId;

/// `HashMap`-backed store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: RwLock<HashMap<RoomId, Room>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a room as-is, replacing any room with the same id.
    pub fn insert(&self, room: Room) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.insert(room.room_id.clone(), room);
    }
}

impl RoomStore for MemoryRoomStore {
    fn create(&self, language: &str) -> Result<Room, StoreError> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        for _ in 0..MAX_ID_ATTEMPTS {
            let room_id = RoomId::generate();
            if rooms.contains_key(&room_id) {
                continue;
            }
            let room = Room::new(room_id.clone(), language);
            rooms.insert(room_id, room.clone());
            return Ok(room);
        }
        Err(StoreError::IdExhausted)
    }

    fn get(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        Ok(rooms.get(room_id).cloned())
    }

    fn set_code(&self, room_id: &RoomId, code: &str) -> Result<bool, StoreError> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        match rooms.get_mut(room_id) {
            Some(room) => {
                room.code = code.to_string();
                room.updated_at = unix_now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_rooms(&self) -> Result<Vec<RoomId>, StoreError> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        Ok(rooms.keys().cloned().collect())
    }
}
