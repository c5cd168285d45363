//! Channel-based fan-out to room members.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a lagging connection drops frames rather than
//! applying backpressure to the sender.
//!
//! Frames are pre-encoded JSON shared behind an `Arc` and tagged with
//! the originating connection id, so each receiver can suppress the
//! echo of its own events. Events that should reach the sender too
//! (chat messages) carry no origin.
//!
//! The channel key space covers room channels (the room id) and
//! per-principal channels (`user:{userId}`), which is how the external
//! invitation flow addresses a single principal's connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// A pre-encoded frame travelling through a channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Connection that produced the event; receivers skip their own.
    pub origin: Option<u64>,
    /// Encoded server frame, shared across all receivers.
    pub frame: Arc<String>,
}

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub connected: usize,
}

/// Atomic counters — lock-free on the send path.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single channel.
///
/// All connections subscribed to the same channel share one broadcast
/// sender; a frame sent once is fanned out to every subscriber.
pub struct BroadcastGroup {
    /// Broadcast channel sender (cloned per subscriber)
    sender: broadcast::Sender<Outbound>,
    /// Subscribed connections: connection id → principal id
    members: RwLock<HashMap<u64, String>>,
    /// Frames buffered per receiver before lag drops
    capacity: usize,
    /// Lock-free stats
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Subscribe a connection to this channel.
    ///
    /// Returns the receiver this connection consumes frames from.
    pub async fn join(&self, conn_id: u64, user_id: impl Into<String>) -> broadcast::Receiver<Outbound> {
        let mut members = self.members.write().await;
        members.insert(conn_id, user_id.into());
        self.sender.subscribe()
    }

    /// Unsubscribe a connection from this channel.
    pub async fn leave(&self, conn_id: u64) -> Option<String> {
        let mut members = self.members.write().await;
        members.remove(&conn_id)
    }

    /// Send a pre-encoded frame to every subscriber.
    ///
    /// `origin` marks the producing connection so its own receiver can
    /// skip the frame; pass `None` to reach everyone including the
    /// producer. Returns the number of receivers the frame reached.
    /// Best-effort: no acknowledgment, no retry.
    pub fn send(&self, origin: Option<u64>, frame: Arc<String>) -> usize {
        let count = self.sender.send(Outbound { origin, frame }).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames lost to receiver lag.
    pub fn note_dropped(&self, n: u64) {
        self.stats.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Number of subscribed connections.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Whether a connection is subscribed.
    pub async fn has_conn(&self, conn_id: u64) -> bool {
        self.members.read().await.contains_key(&conn_id)
    }

    /// Principals currently subscribed (one entry per connection).
    pub async fn members(&self) -> Vec<String> {
        self.members.read().await.values().cloned().collect()
    }

    /// Channel statistics (lock-free counters + member snapshot).
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            connected: self.member_count().await,
        }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Channel map: channel name → broadcast group.
///
/// Room channels are keyed by room id; principal channels use
/// [`ChannelMap::user_channel`] so the invite flow can push a
/// `notification` to one principal.
pub struct ChannelMap {
    channels: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl ChannelMap {
    /// Create a new channel map.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Name of a principal's personal channel.
    pub fn user_channel(user_id: &str) -> String {
        format!("user:{user_id}")
    }

    /// Get or create the group for a channel.
    pub async fn get_or_create(&self, name: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(group) = channels.get(name) {
                return group.clone();
            }
        }

        // Slow path: write lock to create
        let mut channels = self.channels.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = channels.get(name) {
            return group.clone();
        }

        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        channels.insert(name.to_string(), group.clone());
        group
    }

    /// Get-or-create a channel and subscribe a connection to it, as
    /// one step.
    ///
    /// The map lock is held across the member insert, so a concurrent
    /// [`ChannelMap::remove_if_empty`] can never drop the channel
    /// between handle retrieval and subscription and leave the joiner
    /// on an orphaned group that later lookups no longer resolve to.
    pub async fn join(
        &self,
        name: &str,
        conn_id: u64,
        user_id: impl Into<String>,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Outbound>) {
        let mut channels = self.channels.write().await;
        let group = channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        let rx = group.join(conn_id, user_id).await;
        (group, rx)
    }

    /// Get an existing channel group.
    pub async fn get(&self, name: &str) -> Option<Arc<BroadcastGroup>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Remove a channel once nothing is subscribed to it.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(group) = channels.get(name) {
            if group.member_count().await == 0 {
                channels.remove(name);
                return true;
            }
        }
        false
    }

    /// Number of live channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
