//! RocksDB-backed room store.
//!
//! Column families:
//! - `rooms`: room metadata (bincode: language, created_at, updated_at)
//! - `code`: current code buffer (LZ4 compressed), keyed by room id
//!
//! `set_code` rewrites the buffer and bumps `updated_at` in one atomic
//! `WriteBatch`, so a reader never sees a buffer without its metadata.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{unix_now, Room, RoomStore, StoreError, MAX_ID_ATTEMPTS};
use crate::protocol::RoomId;

const CF_ROOMS: &str = "rooms";
const CF_CODE: &str = "code";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_CODE];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pairpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Metadata half of a room; the code lives in its own column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoomRecord {
    language: String,
    created_at: u64,
    updated_at: u64,
}

impl RoomRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

pub struct RocksRoomStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write cycles (one writer per `set_code`).
    write_lock: Mutex<()>,
}

impl RocksRoomStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Already LZ4 on the way in.
            CF_CODE => opts.set_compression_type(DBCompressionType::None),
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn load_record(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, room_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(RoomRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_room(&self, room_id: &RoomId, record: &RoomRecord, code: &str) -> Result<(), StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_code = self.cf(CF_CODE)?;
        let key = room_id.as_str().as_bytes();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_rooms, key, record.encode()?);
        batch.put_cf(cf_code, key, lz4_flex::compress_prepend_size(code.as_bytes()));

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RoomStore for RocksRoomStore {
    fn create(&self, language: &str) -> Result<Room, StoreError> {
        let _guard = self.lock();
        for _ in 0..MAX_ID_ATTEMPTS {
            let room_id = RoomId::generate();
            if self.load_record(&room_id)?.is_some() {
                continue;
            }
            let room = Room::new(room_id, language);
            let record = RoomRecord {
                language: room.language.clone(),
                created_at: room.created_at,
                updated_at: room.updated_at,
            };
            self.write_room(&room.room_id, &record, &room.code)?;
            log::info!("Created room '{}' ({})", room.room_id, room.language);
            return Ok(room);
        }
        Err(StoreError::IdExhausted)
    }

    fn get(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
        let Some(record) = self.load_record(room_id)? else {
            return Ok(None);
        };

        let cf = self.cf(CF_CODE)?;
        let code = match self.db.get_cf(cf, room_id.as_str().as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))?
            }
            None => String::new(),
        };

        Ok(Some(Room {
            room_id: room_id.clone(),
            code,
            language: record.language,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }))
    }

    fn set_code(&self, room_id: &RoomId, code: &str) -> Result<bool, StoreError> {
        let _guard = self.lock();
        let Some(mut record) = self.load_record(room_id)? else {
            return Ok(false);
        };
        record.updated_at = unix_now();
        self.write_room(room_id, &record, code)?;
        Ok(true)
    }

    fn list_rooms(&self) -> Result<Vec<RoomId>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            rooms.push(RoomId::new(id));
        }
        Ok(rooms)
    }
}
