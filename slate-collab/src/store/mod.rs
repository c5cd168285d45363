//! Durable room storage.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   write-through   ┌──────────────┐
//! │ CollabServer │ ────────────────► │ RoomStore    │
//! │ (in-memory)  │                   │ (RocksDB)    │
//! └──────┬───────┘                   └──────┬───────┘
//!        │                                  │ column families
//!        │ on join / restart                ▼
//! ┌──────▼───────┐    ┌─────────────────────────────────────┐
//! │ RoomRegistry │    │ CF "rooms" — LZ4(JSON room records)  │
//! │ (seeded)     │    │ CF "names" — unique name index       │
//! └──────────────┘    │ CF "meta"  — storage-id counter      │
//!                     └─────────────────────────────────────┘
//! ```
//!
//! The store is the source of truth across process restarts and for
//! rooms not currently resident in the registry. Broadcasts are never
//! gated on its writes.

pub mod rocks;

pub use rocks::{Room, RoomStore, StoreConfig, StoreError};
