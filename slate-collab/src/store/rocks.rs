//! RocksDB-backed room repository.
//!
//! Column families:
//! - `rooms` — full room records (LZ4-compressed JSON, keyed by roomId)
//! - `names` — unique name index (normalized name → roomId)
//! - `meta`  — storage-id counter (recovered on open)
//!
//! Room records use the same serde types as the wire contract, so the
//! durable copy of `data.elements` and `messages` is byte-compatible
//! with what clients send. Name uniqueness is enforced here, at the
//! store level, so a concurrent-create conflict surfaces as the
//! distinct [`StoreError::DuplicateName`] rather than a racy
//! validation-time check.
//!
//! Read-modify-write operations (`update_elements`, `add_participant`,
//! `append_message`) are serialized by an internal mutex. Callers must
//! never invoke them while holding a registry room lock.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::protocol::{now_millis, Message, RoomData};

/// Column family names.
const CF_ROOMS: &str = "rooms";
const CF_NAMES: &str = "names";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_NAMES, CF_META];

/// Meta key holding the last assigned storage id.
const META_STORAGE_SEQ: &[u8] = b"storage_seq";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("slate_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// A durable collaboration room: drawing surface, chat history and
/// access-control list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Opaque unique identifier, generated server-side, immutable.
    pub room_id: String,
    pub name: String,
    /// Creating principal, immutable.
    pub owner_id: String,
    /// Principals with standing access. Grows via explicit add, never
    /// shrinks on disconnect.
    pub participants: Vec<String>,
    pub data: RoomData,
    /// Append-only chat history.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Public rooms admit any authenticated principal.
    pub is_public: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Refreshed on every state-affecting write.
    pub updated_at: u64,
}

impl Room {
    /// Build a fresh room with a server-generated id, the creator as
    /// sole owner and participant, and the given initial elements.
    pub fn create(
        name: impl Into<String>,
        owner_id: impl Into<String>,
        is_public: bool,
        data: RoomData,
    ) -> Self {
        let owner_id = owner_id.into();
        let now = now_millis();
        Self {
            room_id: Uuid::new_v4().to_string(),
            name: name.into(),
            owner_id: owner_id.clone(),
            participants: vec![owner_id],
            data,
            messages: Vec::new(),
            is_public,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the given principal has standing access.
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        serde_json::from_slice(&json)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Room not found
    NotFound(String),
    /// Another room already uses this name
    DuplicateName(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Room not found: {id}"),
            StoreError::DuplicateName(name) => write!(f, "Room name already in use: {name}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed room store.
///
/// Provides durable create/find/update operations with:
/// - LZ4-compressed room records
/// - a store-level unique index on room names
/// - bloom filters and a block cache for hot room lookups
/// - atomic write batches for record + index consistency
pub struct RoomStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Last assigned storage id, recovered on open
    storage_seq: AtomicU64,
    /// Serializes read-modify-write operations
    write_lock: Mutex<()>,
}

impl RoomStore {
    /// Open the room store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let storage_seq = Self::recover_storage_seq(&db);

        Ok(Self {
            db,
            config,
            storage_seq: AtomicU64::new(storage_seq),
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS => {
                // Whole records, fetched one at a time
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_NAMES | CF_META => {
                // Tiny values, frequent point reads
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Recover the last assigned storage id from the meta CF.
    fn recover_storage_seq(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_META) {
            Some(cf) => cf,
            None => return 0,
        };
        match db.get_cf(&cf, META_STORAGE_SEQ) {
            Ok(Some(bytes)) if bytes.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[..8]);
                u64::from_be_bytes(buf)
            }
            _ => 0,
        }
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    /// Persist a new room. Returns the assigned storage id.
    ///
    /// Enforces the unique name index: inserting a second room with the
    /// same (case-insensitive) name fails with
    /// [`StoreError::DuplicateName`]. Record, name index and storage-id
    /// counter are written in one atomic batch.
    pub fn insert_room(&self, room: &Room) -> Result<u64, StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_names = self.cf(CF_NAMES)?;
        let cf_meta = self.cf(CF_META)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let name_key = normalize_name(&room.name);
        if self.db.get_cf(&cf_names, &name_key)?.is_some() {
            return Err(StoreError::DuplicateName(room.name.clone()));
        }

        let storage_id = self.storage_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_rooms, room.room_id.as_bytes(), &room.encode()?);
        batch.put_cf(&cf_names, &name_key, room.room_id.as_bytes());
        batch.put_cf(&cf_meta, META_STORAGE_SEQ, storage_id.to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(storage_id)
    }

    /// Look up a room by identifier.
    pub fn find_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(Room::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replace a room's drawing elements wholesale and refresh
    /// `updated_at`.
    pub fn update_elements(
        &self,
        room_id: &str,
        elements: &[serde_json::Value],
    ) -> Result<(), StoreError> {
        self.modify_room(room_id, |room| {
            room.data.elements = elements.to_vec();
        })
    }

    /// Add a principal to a room's participant set (idempotent).
    pub fn add_participant(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.modify_room(room_id, |room| {
            if !room.has_participant(user_id) {
                room.participants.push(user_id.to_string());
            }
        })
    }

    /// Append a chat message to a room's history.
    pub fn append_message(&self, room_id: &str, message: &Message) -> Result<(), StoreError> {
        self.modify_room(room_id, |room| {
            room.messages.push(message.clone());
        })
    }

    /// List all room identifiers in the store.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut room_ids = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::DeserializationError("Invalid room id key".into()))?;
            room_ids.push(id);
        }

        Ok(room_ids)
    }

    /// Number of rooms in the store.
    pub fn room_count(&self) -> Result<usize, StoreError> {
        Ok(self.list_rooms()?.len())
    }

    /// Last assigned storage id.
    pub fn storage_seq(&self) -> u64 {
        self.storage_seq.load(Ordering::SeqCst)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Read-modify-write a room record under the internal write lock.
    /// `updated_at` is refreshed on every call.
    fn modify_room(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room),
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_ROOMS)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let bytes = self
            .db
            .get_cf(&cf, room_id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;
        let mut room = Room::decode(&bytes)?;

        f(&mut room);
        room.updated_at = now_millis();

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, room_id.as_bytes(), &room.encode()?, &write_opts)?;

        Ok(())
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// Case-insensitive key for the unique name index.
fn normalize_name(name: &str) -> Vec<u8> {
    name.trim().to_lowercase().into_bytes()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store(dir: &tempfile::TempDir) -> RoomStore {
        RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_insert_and_find_room() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let room = Room::create("Sprint Planning", "alice", false, RoomData::default());
        let storage_id = store.insert_room(&room).unwrap();
        assert_eq!(storage_id, 1);

        let found = store.find_room(&room.room_id).unwrap().unwrap();
        assert_eq!(found, room);
        assert_eq!(found.participants, vec!["alice"]);
        assert!(!found.is_public);
    }

    #[test]
    fn test_find_missing_room() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.find_room("nope").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let a = Room::create("Design Review", "alice", false, RoomData::default());
        store.insert_room(&a).unwrap();

        // Same name, different case — still a conflict.
        let b = Room::create("design review", "bob", true, RoomData::default());
        match store.insert_room(&b) {
            Err(StoreError::DuplicateName(name)) => assert_eq!(name, "design review"),
            other => panic!("expected DuplicateName, got {other:?}"),
        }

        // The conflicting room was not written.
        assert!(store.find_room(&b.room_id).unwrap().is_none());
        assert_eq!(store.room_count().unwrap(), 1);
    }

    #[test]
    fn test_update_elements_refreshes_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut room = Room::create("Board", "alice", false, RoomData::default());
        room.updated_at = 0; // Force a visible refresh
        store.insert_room(&room).unwrap();

        let elements = vec![json!({"kind": "line"}), json!({"kind": "rect"})];
        store.update_elements(&room.room_id, &elements).unwrap();

        let found = store.find_room(&room.room_id).unwrap().unwrap();
        assert_eq!(found.data.elements, elements);
        assert!(found.updated_at > 0);
    }

    #[test]
    fn test_update_elements_missing_room() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        match store.update_elements("ghost", &[]) {
            Err(StoreError::NotFound(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_add_participant_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let room = Room::create("Board", "alice", false, RoomData::default());
        store.insert_room(&room).unwrap();

        store.add_participant(&room.room_id, "bob").unwrap();
        store.add_participant(&room.room_id, "bob").unwrap();

        let found = store.find_room(&room.room_id).unwrap().unwrap();
        assert_eq!(found.participants, vec!["alice", "bob"]);
    }

    #[test]
    fn test_append_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let room = Room::create("Board", "alice", false, RoomData::default());
        store.insert_room(&room).unwrap();

        let msg = Message::new("alice", "hi");
        store.append_message(&room.room_id, &msg).unwrap();

        let found = store.find_room(&room.room_id).unwrap().unwrap();
        assert_eq!(found.messages, vec![msg]);
    }

    #[test]
    fn test_storage_id_monotonic_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let first;
        {
            let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
            let room = Room::create("One", "alice", false, RoomData::default());
            first = store.insert_room(&room).unwrap();
        }

        let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.storage_seq(), first);

        let room = Room::create("Two", "alice", false, RoomData::default());
        let second = store.insert_room(&room).unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_room_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let room = Room::create(
            "Persistent",
            "alice",
            true,
            RoomData {
                elements: vec![json!({"kind": "line", "points": [0, 0, 4, 4]})],
            },
        );
        {
            let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.insert_room(&room).unwrap();
            store.append_message(&room.room_id, &Message::new("alice", "hello")).unwrap();
        }

        let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
        let found = store.find_room(&room.room_id).unwrap().unwrap();
        assert_eq!(found.name, "Persistent");
        assert_eq!(found.data, room.data);
        assert_eq!(found.messages.len(), 1);
        assert!(found.is_public);
    }

    #[test]
    fn test_list_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let a = Room::create("A", "alice", false, RoomData::default());
        let b = Room::create("B", "bob", false, RoomData::default());
        store.insert_room(&a).unwrap();
        store.insert_room(&b).unwrap();

        let ids = store.list_rooms().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.room_id));
        assert!(ids.contains(&b.room_id));
    }
}
