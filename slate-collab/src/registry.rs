//! In-memory authoritative room state.
//!
//! One [`RoomSessionState`] per active room, held in a process-wide map
//! behind a double-checked get-or-create (read lock fast path, write
//! lock slow path). Each entry carries its own async mutex so that
//! mutations on one room serialize against each other while unrelated
//! rooms make independent progress.
//!
//! Mutation closures are synchronous: nothing can suspend inside a
//! room's critical section, so readers never observe a partial update.
//! Durable writes happen outside these sections.
//!
//! Entries are created lazily on first join and reaped by the server's
//! idle sweep once a room has been untouched long enough and has no
//! connected members.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Transient mirror of a room's live elements and known participants.
///
/// `participants` is a superset of connected sockets: membership is
/// sticky, a principal stays in the set after disconnecting.
#[derive(Debug)]
pub struct RoomSessionState {
    /// Current drawing elements; replaced wholesale on each update.
    pub elements: Vec<Value>,
    /// Principals known to be members of this room.
    pub participants: HashSet<String>,
    /// Last mutation time, drives idle eviction.
    last_touched: Instant,
}

impl RoomSessionState {
    fn new(elements: Vec<Value>) -> Self {
        Self {
            elements,
            participants: HashSet::new(),
            last_touched: Instant::now(),
        }
    }

    /// How long since this room was last mutated.
    pub fn idle_for(&self) -> Duration {
        self.last_touched.elapsed()
    }
}

/// Process-wide registry of active room session state.
///
/// The map itself is never exposed; callers go through
/// `get_or_init` / `get` / `mutate`.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomSessionState>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Get the session state for a room, creating it seeded from
    /// `fallback_elements` if absent.
    ///
    /// Idempotent under races: concurrent first-touches for the same
    /// room converge on a single state, seeded exactly once. Later
    /// callers' fallbacks are ignored.
    pub async fn get_or_init(
        &self,
        room_id: &str,
        fallback_elements: Vec<Value>,
    ) -> Arc<Mutex<RoomSessionState>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(state) = rooms.get(room_id) {
                return state.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(state) = rooms.get(room_id) {
            return state.clone();
        }

        let state = Arc::new(Mutex::new(RoomSessionState::new(fallback_elements)));
        rooms.insert(room_id.to_string(), state.clone());
        state
    }

    /// Get a room's session state without creating it.
    pub async fn get(&self, room_id: &str) -> Option<Arc<Mutex<RoomSessionState>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Apply an atomic mutation to a room's state under its lock.
    ///
    /// Returns `None` when the room has no resident state. The closure
    /// is synchronous by construction: no suspension point can occur
    /// inside the critical section.
    pub async fn mutate<R>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut RoomSessionState) -> R,
    ) -> Option<R> {
        let state = self.get(room_id).await?;
        let mut guard = state.lock().await;
        let result = f(&mut guard);
        guard.last_touched = Instant::now();
        Some(result)
    }

    /// Number of resident rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Rooms untouched for at least `idle_for`.
    ///
    /// Candidates only — the caller decides whether a room is actually
    /// evictable (it must also have no connected members).
    pub async fn idle_rooms(&self, idle_for: Duration) -> Vec<String> {
        let rooms = self.rooms.read().await;
        let mut idle = Vec::new();
        for (room_id, state) in rooms.iter() {
            let guard = state.lock().await;
            if guard.idle_for() >= idle_for {
                idle.push(room_id.clone());
            }
        }
        idle
    }

    /// Drop a room's resident state. Durable state is unaffected.
    pub async fn remove(&self, room_id: &str) -> bool {
        self.rooms.write().await.remove(room_id).is_some()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_or_init_seeds_once() {
        let registry = RoomRegistry::new();

        let first = registry
            .get_or_init("r1", vec![json!({"kind": "line"})])
            .await;
        assert_eq!(first.lock().await.elements.len(), 1);

        // Second call with a different fallback does not reseed.
        let second = registry
            .get_or_init("r1", vec![json!({"a": 1}), json!({"b": 2})])
            .await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.elements.len(), 1);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_touch_converges() {
        let registry = Arc::new(RoomRegistry::new());
        let seed = vec![json!({"kind": "seed"})];

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let seed = seed.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_init("contested", seed).await
            }));
        }

        let states: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        // All callers observe the same instance and the same seed.
        for state in &states {
            assert!(Arc::ptr_eq(&states[0], state));
            assert_eq!(state.lock().await.elements, seed);
        }
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_get_does_not_create() {
        let registry = RoomRegistry::new();
        assert!(registry.get("ghost").await.is_none());
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_mutate_absent_room_is_none() {
        let registry = RoomRegistry::new();
        let result = registry.mutate("ghost", |state| state.participants.len()).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_mutate_participants_and_elements() {
        let registry = RoomRegistry::new();
        registry.get_or_init("r1", Vec::new()).await;

        registry
            .mutate("r1", |state| {
                state.participants.insert("alice".to_string());
                state.participants.insert("alice".to_string());
                state.participants.insert("bob".to_string());
            })
            .await
            .unwrap();

        let elements = vec![json!({"kind": "rect"})];
        let snapshot = registry
            .mutate("r1", |state| {
                state.elements = elements.clone();
                (state.elements.clone(), state.participants.len())
            })
            .await
            .unwrap();

        assert_eq!(snapshot.0, elements);
        assert_eq!(snapshot.1, 2);
    }

    #[tokio::test]
    async fn test_serialized_mutations_no_interleaving() {
        let registry = Arc::new(RoomRegistry::new());
        registry.get_or_init("r1", Vec::new()).await;

        // Each task appends two paired elements under one mutate call;
        // pairs must never interleave.
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .mutate("r1", move |state| {
                        state.elements.push(json!({"open": i}));
                        state.elements.push(json!({"close": i}));
                    })
                    .await
                    .unwrap();
            }));
        }
        futures_util::future::join_all(handles).await;

        let elements = registry
            .mutate("r1", |state| state.elements.clone())
            .await
            .unwrap();
        assert_eq!(elements.len(), 16);
        for pair in elements.chunks(2) {
            assert_eq!(pair[0]["open"], pair[1]["close"]);
        }
    }

    #[tokio::test]
    async fn test_idle_rooms_and_remove() {
        let registry = RoomRegistry::new();
        registry.get_or_init("r1", Vec::new()).await;
        registry.get_or_init("r2", Vec::new()).await;

        // Zero threshold: everything is idle.
        let idle = registry.idle_rooms(Duration::ZERO).await;
        assert_eq!(idle.len(), 2);

        // Long threshold: nothing is.
        let idle = registry.idle_rooms(Duration::from_secs(3600)).await;
        assert!(idle.is_empty());

        assert!(registry.remove("r1").await);
        assert!(!registry.remove("r1").await);
        assert_eq!(registry.room_count().await, 1);
    }
}
