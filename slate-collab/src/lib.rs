//! # slate-collab — Room session coordinator for real-time whiteboards
//!
//! WebSocket server coordinating collaborative drawing rooms: cursor
//! presence, wholesale drawing-element sync, and room chat, with rooms
//! persisted to an embedded store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ Browser     │ ◄─────────────────► │ CollabServer │
//! │ client      │     JSON frames     │ (coordinator)│
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                      ┌─────────────────────┼─────────────────────┐
//!                      ▼                     ▼                     ▼
//!               ┌─────────────┐      ┌──────────────┐      ┌─────────────┐
//!               │ RoomRegistry│      │ ChannelMap   │      │ RoomStore   │
//!               │ (in-memory  │      │ (broadcast   │      │ (RocksDB,   │
//!               │  authority) │      │  fan-out)    │      │  durable)   │
//!               └─────────────┘      └──────────────┘      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (event envelopes, acks, schemas)
//! - [`auth`] — Access policy gate (HS256 tokens + room-access rule)
//! - [`registry`] — In-memory authoritative room session state
//! - [`broadcast`] — Channel-based fan-out to room members
//! - [`store`] — Durable room repository (RocksDB + LZ4)
//! - [`server`] — The session coordinator itself
//!
//! The event loop broadcasts before it persists: peers see an update
//! as soon as the in-memory authority accepts it, and the durable
//! write completes on a detached task.

pub mod auth;
pub mod broadcast;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use auth::{AuthError, Handshake, Principal};
pub use broadcast::{BroadcastGroup, BroadcastStats, ChannelMap};
pub use protocol::{
    Ack, ClientEvent, ClientFrame, Message, ProtocolError, RoomData, RoomDraft,
    ServerEvent, ServerFrame, ValidationError,
};
pub use registry::{RoomRegistry, RoomSessionState};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use store::{Room, RoomStore, StoreConfig, StoreError};
