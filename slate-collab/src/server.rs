//! WebSocket session coordinator with room-based event routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (roomId) ── RoomSessionState ── BroadcastGroup
//! Client B ──┘                          │
//!                                       ├── RoomStore (RocksDB)
//!                                       │      write-through,
//!                                       │      detached from broadcast
//!                          ┌────────────┼────────────┐
//!                          ▼            ▼            ▼
//!                       Client A     Client B     Client C
//! ```
//!
//! Per-connection lifecycle: HTTP upgrade → access policy gate →
//! authenticated context → event loop → disconnect cleanup. Each
//! connection runs on its own task; per-room state mutations are
//! serialized by the registry's room locks, and durable writes never
//! happen inside those critical sections. Broadcasts are not gated on
//! persistence: a failed detached write is logged and counted, while
//! peers have already received the event.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::auth::{self, Handshake, Principal};
use crate::broadcast::{BroadcastGroup, ChannelMap, Outbound};
use crate::protocol::{
    validate_message_text, Ack, ClientEvent, ClientFrame, Message, ProtocolError, RoomDraft,
    ServerEvent, ServerFrame,
};
use crate::registry::RoomRegistry;
use crate::store::{Room, RoomStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// HS256 signing secret; unset means every connection is rejected
    pub jwt_secret: Option<String>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Room store directory
    pub storage_path: PathBuf,
    /// Evict resident rooms untouched for this long with no members
    pub idle_room_timeout: Duration,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            jwt_secret: None,
            broadcast_capacity: 256,
            storage_path: PathBuf::from("slate_data"),
            idle_room_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Connections the access policy gate turned away
    pub rejected_connections: u64,
    pub total_events: u64,
    /// Frames fanned out to room channels
    pub total_broadcasts: u64,
    /// Detached durable writes that failed after their broadcast
    pub persist_failures: u64,
    pub active_rooms: usize,
}

/// Authenticated context created once at gate success and carried for
/// the connection's lifetime.
struct ConnectionCtx {
    conn_id: u64,
    principal: Principal,
}

/// The room session coordinator.
#[derive(Clone)]
pub struct CollabServer {
    config: ServerConfig,
    /// In-memory authoritative room state
    registry: Arc<RoomRegistry>,
    /// Broadcast channels: rooms and per-principal
    channels: Arc<ChannelMap>,
    /// Durable room repository
    store: Arc<RoomStore>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// Connection id allocator
    next_conn_id: Arc<AtomicU64>,
}

impl CollabServer {
    /// Create a server, opening the room store at the configured path.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store_config = StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        };
        let store = Arc::new(RoomStore::open(store_config)?);
        let channels = Arc::new(ChannelMap::new(config.broadcast_capacity));

        Ok(Self {
            config,
            registry: Arc::new(RoomRegistry::new()),
            channels,
            store,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop and the idle-room eviction sweep. Call
    /// from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session coordinator listening on {}", self.config.bind_addr);

        if self.config.jwt_secret.is_none() {
            log::warn!("No signing secret configured - every connection will be rejected");
        }

        let _sweep = self.spawn_sweep();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Push an event to every connection of one principal.
    ///
    /// This is the outbound notification channel the external invite
    /// flow uses: `emit_to_user(user_id, ServerEvent::Notification(…))`.
    /// Returns the number of connections reached (0 when the principal
    /// has none).
    pub async fn emit_to_user(
        &self,
        user_id: &str,
        event: ServerEvent,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(ServerFrame::push(event).encode()?);
        let channel = ChannelMap::user_channel(user_id);
        Ok(match self.channels.get(&channel).await {
            Some(group) => group.send(None, frame),
            None => 0,
        })
    }

    /// One eviction pass: drop resident rooms untouched for the
    /// configured timeout that have no connected members. Returns the
    /// number of rooms evicted.
    pub async fn evict_idle_rooms(&self) -> usize {
        let mut evicted = 0;
        for room_id in self.registry.idle_rooms(self.config.idle_room_timeout).await {
            let connected = match self.channels.get(&room_id).await {
                Some(group) => group.member_count().await,
                None => 0,
            };
            if connected == 0 && self.registry.remove(&room_id).await {
                self.channels.remove_if_empty(&room_id).await;
                evicted += 1;
                log::info!("Evicted idle room {room_id}");
            }
        }
        evicted
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the durable room store.
    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut handshake = Handshake::default();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            handshake = Handshake::from_request(req);
            Ok(resp)
        })
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Access policy gate — runs before any event handler. The
        // client sees one generic error; the distinct reason stays in
        // the logs.
        let principal = match auth::authenticate(
            &handshake,
            self.config.jwt_secret.as_deref(),
            &self.store,
        ) {
            Ok(principal) => principal,
            Err(reason) => {
                log::warn!("Rejected connection from {addr}: {reason}");
                {
                    let mut s = self.stats.write().await;
                    s.rejected_connections += 1;
                    s.active_connections -= 1;
                }
                let frame = ServerFrame::push(ServerEvent::Error {
                    message: "Authentication error".into(),
                })
                .encode()?;
                let _ = ws_sender.send(WsMessage::Text(frame.into())).await;
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                return Ok(());
            }
        };

        let conn = ConnectionCtx {
            conn_id: self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1,
            principal,
        };
        log::info!(
            "Connection {} authenticated as {} from {addr}",
            conn.conn_id,
            conn.principal.user_id
        );

        // Frames from every subscribed channel funnel into one queue.
        let (out_tx, mut out_rx) = mpsc::channel::<Arc<String>>(self.config.broadcast_capacity);
        let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
        let mut joined_rooms: HashSet<String> = HashSet::new();

        // Personal channel, so notifications can reach this principal.
        let user_channel = ChannelMap::user_channel(&conn.principal.user_id);
        self.join_channel(&user_channel, &conn, &mut forwarders, &out_tx).await;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            {
                                let mut s = self.stats.write().await;
                                s.total_events += 1;
                            }
                            match ClientFrame::decode(text.as_str()) {
                                Ok(frame) => {
                                    let reply = self
                                        .dispatch(&conn, frame, &mut joined_rooms, &mut forwarders, &out_tx)
                                        .await;
                                    if let Some(reply) = reply {
                                        match reply.encode() {
                                            Ok(encoded) => {
                                                if ws_sender.send(WsMessage::Text(encoded.into())).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(e) => log::error!("Failed to encode reply: {e}"),
                                        }
                                    }
                                }
                                Err(e) => log::warn!("Bad frame from {addr}: {e}"),
                            }
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            if ws_sender.send(WsMessage::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection {} closed", conn.conn_id);
                            break;
                        }

                        Some(Err(e)) => {
                            log::debug!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = out_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_sender.send(WsMessage::Text(frame.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Cleanup: leave every channel. Membership is sticky — the
        // participant sets, in-memory and durable, are untouched.
        for handle in &forwarders {
            handle.abort();
        }
        for name in joined_rooms.iter().chain(std::iter::once(&user_channel)) {
            if let Some(group) = self.channels.get(name).await {
                group.leave(conn.conn_id).await;
                self.channels.remove_if_empty(name).await;
            }
        }

        let mut s = self.stats.write().await;
        s.active_connections -= 1;

        Ok(())
    }

    // ─── Event handlers ───────────────────────────────────────────────

    /// Route one client event. Returns the ack frame to send back, if
    /// the event expects one.
    async fn dispatch(
        &self,
        conn: &ConnectionCtx,
        frame: ClientFrame,
        joined_rooms: &mut HashSet<String>,
        forwarders: &mut Vec<JoinHandle<()>>,
        out_tx: &mpsc::Sender<Arc<String>>,
    ) -> Option<ServerFrame> {
        match frame.event {
            ClientEvent::CursorMove { room_id, x, y } => {
                // Fire-and-forget; only meaningful once joined.
                if joined_rooms.contains(&room_id) {
                    self.broadcast_room(
                        &room_id,
                        Some(conn.conn_id),
                        ServerEvent::CursorUpdate {
                            user_id: conn.principal.user_id.clone(),
                            x,
                            y,
                        },
                    )
                    .await;
                }
                None
            }

            ClientEvent::CreateAndJoinRoom(draft) => {
                let ack = self
                    .handle_create(conn, draft, joined_rooms, forwarders, out_tx)
                    .await;
                Some(ServerFrame::ack(frame.seq, ack))
            }

            ClientEvent::JoinRoom { room_id } => {
                let ack = self
                    .handle_join(conn, &room_id, joined_rooms, forwarders, out_tx)
                    .await;
                Some(ServerFrame::ack(frame.seq, ack))
            }

            ClientEvent::DrawingUpdate { room_id, elements } => {
                self.handle_drawing(conn, room_id, elements).await;
                None
            }

            ClientEvent::SendMessage { room_id, text } => {
                let ack = self.handle_message(conn, &room_id, &text).await;
                Some(ServerFrame::ack(frame.seq, ack))
            }
        }
    }

    /// `createAndJoinRoom`: persist a new room with the caller as sole
    /// owner and participant, seed the registry, join the channel.
    async fn handle_create(
        &self,
        conn: &ConnectionCtx,
        draft: RoomDraft,
        joined_rooms: &mut HashSet<String>,
        forwarders: &mut Vec<JoinHandle<()>>,
        out_tx: &mpsc::Sender<Arc<String>>,
    ) -> Ack {
        if let Err(e) = draft.validate() {
            log::warn!("Room creation rejected for {}: {e}", conn.principal.user_id);
            return Ack::failure("Invalid room data");
        }

        let data = draft.data.clone().unwrap_or_default();
        let room = Room::create(
            draft.resolved_name(),
            &conn.principal.user_id,
            draft.is_public.unwrap_or(false),
            data.clone(),
        );

        let storage_id = match self.store.insert_room(&room) {
            Ok(id) => id,
            Err(e @ StoreError::DuplicateName(_)) => {
                // Store-level unique index; a concurrent-create
                // conflict is reported distinctly, not retried.
                log::warn!("Room creation conflict for {}: {e}", conn.principal.user_id);
                return Ack::failure(e.to_string());
            }
            Err(e) => {
                log::error!("Room creation failed for {}: {e}", conn.principal.user_id);
                return Ack::failure("Failed to create room");
            }
        };

        self.registry.get_or_init(&room.room_id, data.elements).await;
        let user_id = conn.principal.user_id.clone();
        self.registry
            .mutate(&room.room_id, move |state| {
                state.participants.insert(user_id);
            })
            .await;

        self.join_channel(&room.room_id, conn, forwarders, out_tx).await;
        joined_rooms.insert(room.room_id.clone());

        log::info!(
            "Room {} ({}) created by {}",
            room.room_id,
            room.name,
            conn.principal.user_id
        );
        Ack::created(room.room_id, storage_id)
    }

    /// `joinRoom`: resolve the durable room, lazily init the registry
    /// entry from its elements, record membership (in-memory and
    /// durable), join the channel, tell the others.
    async fn handle_join(
        &self,
        conn: &ConnectionCtx,
        room_id: &str,
        joined_rooms: &mut HashSet<String>,
        forwarders: &mut Vec<JoinHandle<()>>,
        out_tx: &mpsc::Sender<Arc<String>>,
    ) -> Ack {
        let room = match self.store.find_room(room_id) {
            Ok(Some(room)) => room,
            Ok(None) => return Ack::failure("Room not found"),
            Err(e) => {
                log::error!("Join lookup failed for room {room_id}: {e}");
                return Ack::failure("Server error");
            }
        };

        // The eviction sweep can reap the entry between init and
        // mutate; re-seed from the durable copy already in hand until
        // the mutation lands, so the race stays invisible to the
        // caller.
        let (elements, participants) = loop {
            self.registry
                .get_or_init(room_id, room.data.elements.clone())
                .await;

            let user_id = conn.principal.user_id.clone();
            let snapshot = self
                .registry
                .mutate(room_id, move |state| {
                    state.participants.insert(user_id);
                    let mut participants: Vec<String> =
                        state.participants.iter().cloned().collect();
                    participants.sort();
                    (state.elements.clone(), participants)
                })
                .await;
            match snapshot {
                Some(snapshot) => break snapshot,
                None => log::debug!("Room {room_id} evicted during join, re-seeding"),
            }
        };

        // Durable membership gates the ack, not any broadcast.
        if let Err(e) = self.store.add_participant(room_id, &conn.principal.user_id) {
            log::error!(
                "Failed to persist membership of {} in room {room_id}: {e}",
                conn.principal.user_id
            );
            return Ack::failure("Server error");
        }

        self.join_channel(room_id, conn, forwarders, out_tx).await;
        joined_rooms.insert(room_id.to_string());

        self.broadcast_room(
            room_id,
            Some(conn.conn_id),
            ServerEvent::UserJoined {
                user_id: conn.principal.user_id.clone(),
                participants: participants.clone(),
            },
        )
        .await;

        log::info!("{} joined room {room_id}", conn.principal.user_id);
        Ack::joined(elements, participants)
    }

    /// `drawingUpdate`: replace the resident elements wholesale (last
    /// write wins), broadcast to the other members, persist detached.
    ///
    /// Silently a no-op when the room has no resident session state:
    /// no broadcast, no durable write.
    async fn handle_drawing(
        &self,
        conn: &ConnectionCtx,
        room_id: String,
        elements: Vec<serde_json::Value>,
    ) {
        let replaced = {
            let elements = elements.clone();
            self.registry
                .mutate(&room_id, move |state| {
                    state.elements = elements;
                })
                .await
        };
        if replaced.is_none() {
            log::debug!("Ignoring drawingUpdate for non-resident room {room_id}");
            return;
        }

        self.broadcast_room(
            &room_id,
            Some(conn.conn_id),
            ServerEvent::DrawingUpdate(elements.clone()),
        )
        .await;

        // Detached persistence: the broadcast above never waits on
        // this write. A failure is logged with context and counted so
        // the inconsistency window stays observable.
        let store = self.store.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_elements(&room_id, &elements) {
                log::error!("Failed to persist elements for room {room_id}: {e}");
                stats.write().await.persist_failures += 1;
            }
        });
    }

    /// `sendMessage`: validate, append durably, then echo to the whole
    /// room including the sender.
    async fn handle_message(&self, conn: &ConnectionCtx, room_id: &str, text: &str) -> Ack {
        if let Err(e) = validate_message_text(text) {
            return Ack::failure(e.to_string());
        }

        let message = Message::new(&conn.principal.user_id, text);
        match self.store.append_message(room_id, &message) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Ack::failure("Room not found"),
            Err(e) => {
                log::error!("Failed to append message to room {room_id}: {e}");
                return Ack::failure("Server error");
            }
        }

        // No origin: chat echoes back to the sender as its delivery
        // confirmation.
        self.broadcast_room(room_id, None, ServerEvent::NewMessage(message)).await;
        Ack::ok()
    }

    // ─── Plumbing ─────────────────────────────────────────────────────

    /// Encode an event once and fan it out to a room's channel.
    async fn broadcast_room(
        &self,
        room_id: &str,
        origin: Option<u64>,
        event: ServerEvent,
    ) -> usize {
        let Some(group) = self.channels.get(room_id).await else {
            return 0;
        };
        match ServerFrame::push(event).encode() {
            Ok(encoded) => {
                let reached = group.send(origin, Arc::new(encoded));
                self.stats.write().await.total_broadcasts += 1;
                reached
            }
            Err(e) => {
                log::error!("Failed to encode broadcast for room {room_id}: {e}");
                0
            }
        }
    }

    /// Subscribe a connection to a channel and pump its frames into
    /// the connection's outbound queue, suppressing the echo of the
    /// connection's own events.
    ///
    /// Subscription goes through [`ChannelMap::join`] so the member
    /// insert is atomic with the channel's residency in the map: a
    /// concurrent disconnect cleanup or eviction sweep reaping a
    /// momentarily-empty channel cannot strand this connection on a
    /// group later broadcasts no longer reach.
    async fn join_channel(
        &self,
        name: &str,
        conn: &ConnectionCtx,
        forwarders: &mut Vec<JoinHandle<()>>,
        out_tx: &mpsc::Sender<Arc<String>>,
    ) {
        if let Some(group) = self.channels.get(name).await {
            if group.has_conn(conn.conn_id).await {
                return;
            }
        }
        let (group, rx) = self
            .channels
            .join(name, conn.conn_id, conn.principal.user_id.as_str())
            .await;
        forwarders.push(spawn_forwarder(group, rx, conn.conn_id, out_tx.clone()));
    }

    /// Periodic idle-room eviction.
    fn spawn_sweep(&self) -> JoinHandle<()> {
        let server = self.clone();
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately
            loop {
                ticker.tick().await;
                let evicted = server.evict_idle_rooms().await;
                if evicted > 0 {
                    log::debug!("Eviction sweep removed {evicted} rooms");
                }
            }
        })
    }
}

/// Pump frames from one channel subscription into a connection's
/// outbound queue, skipping the connection's own events.
fn spawn_forwarder(
    group: Arc<BroadcastGroup>,
    mut rx: broadcast::Receiver<Outbound>,
    conn_id: u64,
    out_tx: mpsc::Sender<Arc<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(out) => {
                    if out.origin == Some(conn_id) {
                        continue;
                    }
                    if out_tx.send(out.frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    group.note_dropped(n);
                    log::warn!("Connection {conn_id} lagged by {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
