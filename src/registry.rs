//! Room registry: the single authority for the room-id → room mapping.
//!
//! ```text
//!            get_or_create("doc-1")
//! gateway ──────────────────────────► RoomRegistry
//!                                        │  rooms: id → RoomHandle
//!                                        │  pending: id → eviction timer
//!                                        │
//!          RoomEvent::Idle ◄─────────────┤ room actors
//!          (schedule eviction)           ▼
//!                                     destroy + remove after grace period
//! ```
//!
//! At most one live room exists per id: resolution goes through a
//! double-checked read/write lock, and a room whose actor has exited is
//! treated as absent and replaced. Idle rooms are destroyed only after a
//! grace period, and the timer is cancelled the moment someone resolves
//! the id again, so brief disconnect/reconnect cycles never pay a
//! snapshot reload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::room::{Room, RoomEvent, RoomHandle, RoomSettings};
use crate::store::{SnapshotStore, StoreError};

/// Registry errors.
#[derive(Debug)]
pub enum RegistryError {
    /// Registry is shutting down; no new rooms are created.
    ShuttingDown,
    /// Some rooms failed their final flush during shutdown.
    Partial(Vec<(String, StoreError)>),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::ShuttingDown => write!(f, "Registry is shutting down"),
            RegistryError::Partial(failures) => {
                write!(f, "{} room(s) failed their final flush:", failures.len())?;
                for (room_id, e) in failures {
                    write!(f, " '{room_id}': {e};")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry-wide counters for health reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    /// Live rooms in the map.
    pub rooms: usize,
    /// Clients connected across all rooms.
    pub clients: usize,
}

struct RegistryInner {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    /// Armed eviction timers, keyed by room id
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
    store: Arc<dyn SnapshotStore>,
    settings: RoomSettings,
    idle_eviction: std::time::Duration,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    shutting_down: AtomicBool,
}

/// Cloneable handle to the shared room map.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    /// Create the registry and spawn its idle-event listener.
    pub fn new(store: Arc<dyn SnapshotStore>, config: &EngineConfig) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RegistryInner {
            rooms: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            store,
            settings: RoomSettings {
                debounce: config.debounce,
                retry: config.retry.clone(),
            },
            idle_eviction: config.idle_eviction,
            events_tx,
            shutting_down: AtomicBool::new(false),
        });

        // Idle events flow out of room actors; a weak ref here lets the
        // listener die with the last real registry handle.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(RoomEvent::Idle { room_id }) = events_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                RoomRegistry { inner }.schedule_eviction(room_id);
            }
        });

        Self { inner }
    }

    /// Resolve a room id to its live room, creating the room if needed.
    ///
    /// Resolving an id disarms any pending eviction for it.
    pub fn get_or_create(&self, room_id: &str) -> Result<RoomHandle, RegistryError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }

        self.cancel_pending_eviction(room_id);

        // Fast path under the read lock
        if let Some(handle) = self.inner.rooms.read().expect("rooms lock").get(room_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let mut rooms = self.inner.rooms.write().expect("rooms lock");
        // Re-check: another caller may have created it while we waited
        if let Some(handle) = rooms.get(room_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            // Actor exited underneath us; replace the stale handle
            rooms.remove(room_id);
        }

        log::debug!("creating room '{room_id}'");
        let handle = Room::spawn(
            room_id.to_string(),
            self.inner.store.clone(),
            self.inner.settings.clone(),
            self.inner.events_tx.clone(),
        );
        rooms.insert(room_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.inner.rooms.read().expect("rooms lock").len()
    }

    /// Point-in-time room and client counts across the registry.
    pub async fn stats(&self) -> RegistryStats {
        let handles: Vec<RoomHandle> = self
            .inner
            .rooms
            .read()
            .expect("rooms lock")
            .values()
            .cloned()
            .collect();
        let rooms = handles.len();
        let counts =
            futures_util::future::join_all(handles.iter().map(|h| h.client_count())).await;
        RegistryStats { rooms, clients: counts.into_iter().sum() }
    }

    /// Disarm the eviction timer for a room, if one is armed.
    pub fn cancel_pending_eviction(&self, room_id: &str) {
        if let Some(timer) = self.inner.pending.lock().expect("pending lock").remove(room_id) {
            timer.abort();
            log::debug!("eviction for room '{room_id}' cancelled");
        }
    }

    /// Arm (or re-arm) the eviction timer for a now-idle room.
    fn schedule_eviction(&self, room_id: String) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let grace = self.inner.idle_eviction;
        let registry = self.clone();
        let timer_id = room_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.evict_if_idle(&timer_id).await;
        });

        log::debug!("room '{room_id}' idle, eviction in {grace:?}");
        if let Some(stale) = self
            .inner
            .pending
            .lock()
            .expect("pending lock")
            .insert(room_id, timer)
        {
            stale.abort();
        }
    }

    /// Eviction timer fired: destroy the room unless someone came back.
    ///
    /// The emptiness check happens inside the room actor, serialized with
    /// joins, so a client that slipped in after the timer fired makes the
    /// destroy decline instead of being thrown out.
    async fn evict_if_idle(&self, room_id: &str) {
        self.inner.pending.lock().expect("pending lock").remove(room_id);

        let handle = match self.inner.rooms.read().expect("rooms lock").get(room_id) {
            Some(handle) => handle.clone(),
            None => return,
        };

        match handle.destroy_if_empty().await {
            Ok(false) => return,
            Ok(true) => log::info!("evicted idle room '{room_id}'"),
            Err(e) => {
                // The drain-time save already ran; losing this one costs at
                // most the writes since then, and the log records it.
                log::error!("final flush for evicted room '{room_id}' failed: {e}");
            }
        }

        // Only unmap the actor we destroyed; a re-resolve may already have
        // replaced it with a fresh room under the same id
        let mut rooms = self.inner.rooms.write().expect("rooms lock");
        if rooms.get(room_id).is_some_and(|current| current.same_room(&handle)) {
            rooms.remove(room_id);
        }
    }

    /// Destroy every room, flushing dirty state. Used at shutdown.
    ///
    /// Further `get_or_create` calls fail with [`RegistryError::ShuttingDown`].
    pub async fn destroy_all(&self) -> Result<(), RegistryError> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let timers: Vec<(String, JoinHandle<()>)> = self
            .inner
            .pending
            .lock()
            .expect("pending lock")
            .drain()
            .collect();
        for (_, timer) in timers {
            timer.abort();
        }

        let rooms: Vec<(String, RoomHandle)> = self
            .inner
            .rooms
            .write()
            .expect("rooms lock")
            .drain()
            .collect();

        log::info!("destroying {} room(s)", rooms.len());
        let results = futures_util::future::join_all(
            rooms
                .into_iter()
                .map(|(room_id, handle)| async move { (room_id, handle.destroy().await) }),
        )
        .await;

        let mut failures = Vec::new();
        for (room_id, result) in results {
            if let Err(e) = result {
                log::error!("final flush for room '{room_id}' failed: {e}");
                failures.push((room_id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Partial(failures))
        }
    }
}
