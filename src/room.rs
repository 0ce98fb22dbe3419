//! Room actor: single-writer document mutation with ordered fan-out.
//!
//! ```text
//! gateway task A ──┐
//! gateway task B ──┼── mpsc ──► Room task ── CrdtDoc
//! gateway task C ──┘   queue        │
//!                                   ├── bounded outbound queue per client
//!                                   └── debounced snapshot → SnapshotStore
//! ```
//!
//! One task per room owns the document and the client set; connection
//! handlers only push [`RoomCmd`]s onto the queue. Updates are applied and
//! broadcast strictly in queue order, which preserves causal delivery
//! per peer even though the merge itself is commutative.
//!
//! Lifecycle: `Loading → Active → Draining → Destroyed`. The handle is
//! usable immediately; joins received while the snapshot loads simply wait
//! in the channel. Once a `Destroy` command is processed the actor drains
//! the queue (joins get [`RoomError::Closed`]) and exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::Identity;
use crate::document::CrdtDoc;
use crate::protocol::Frame;
use crate::store::{save_with_retry, RetryPolicy, SnapshotStore, StoreError};

/// Commands pushed onto a room's single-consumer queue.
pub enum RoomCmd {
    /// A client wants in. Replies with the encoded initial sync frame:
    /// full state, or a diff when a state vector is supplied.
    Join {
        session_id: Uuid,
        identity: Identity,
        state_vector: Option<Vec<u8>>,
        outbound: mpsc::Sender<Arc<Vec<u8>>>,
        reply: oneshot::Sender<Result<Vec<u8>, RoomError>>,
    },
    /// Apply a client's update and fan it out to everyone else.
    Update { from: Uuid, update: Vec<u8> },
    /// Mid-session resync: client announces its state vector, gets a diff.
    Resync { from: Uuid, state_vector: Vec<u8> },
    /// Transport closed (clean or abrupt).
    Leave { session_id: Uuid },
    /// Final flush and shutdown; replies `Ok(true)` once destroyed.
    /// With `if_empty`, the actor declines (`Ok(false)`) when clients are
    /// still connected, so the emptiness check is serialized with joins.
    Destroy { if_empty: bool, reply: oneshot::Sender<Result<bool, StoreError>> },
    /// Connected-client count (health surface).
    ClientCount { reply: oneshot::Sender<usize> },
    /// Internal: the detached snapshot write settled.
    FlushDone { result: Result<(), StoreError> },
}

/// Room-scoped errors returned to connection handlers.
#[derive(Debug, Clone)]
pub enum RoomError {
    /// Room is draining or destroyed; re-resolve through the registry.
    Closed,
    /// The join carried an unusable state vector or framing failed.
    Protocol(String),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::Closed => write!(f, "Room is closed"),
            RoomError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for RoomError {}

/// Events a room raises toward the registry.
#[derive(Debug)]
pub enum RoomEvent {
    /// Last client left; eviction should be scheduled.
    Idle { room_id: String },
}

/// Cheap cloneable handle to a room's command queue.
#[derive(Clone)]
pub struct RoomHandle {
    id: Arc<str>,
    tx: mpsc::Sender<RoomCmd>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle").field("id", &self.id).finish()
    }
}

impl RoomHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the actor behind this handle has exited.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles point at the same actor, not just the same id.
    pub(crate) fn same_room(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Join the room. Returns the encoded initial sync frame.
    pub async fn join(
        &self,
        session_id: Uuid,
        identity: Identity,
        state_vector: Option<Vec<u8>>,
        outbound: mpsc::Sender<Arc<Vec<u8>>>,
    ) -> Result<Vec<u8>, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCmd::Join { session_id, identity, state_vector, outbound, reply })
            .await
            .map_err(|_| RoomError::Closed)?;
        rx.await.map_err(|_| RoomError::Closed)?
    }

    /// Queue an update for application and broadcast.
    pub async fn apply_update(&self, from: Uuid, update: Vec<u8>) -> Result<(), RoomError> {
        self.tx
            .send(RoomCmd::Update { from, update })
            .await
            .map_err(|_| RoomError::Closed)
    }

    /// Queue a resync request; the diff arrives on the session's outbound queue.
    pub async fn resync(&self, from: Uuid, state_vector: Vec<u8>) -> Result<(), RoomError> {
        self.tx
            .send(RoomCmd::Resync { from, state_vector })
            .await
            .map_err(|_| RoomError::Closed)
    }

    /// Remove a session. A no-op if the room is already gone.
    pub async fn leave(&self, session_id: Uuid) {
        let _ = self.tx.send(RoomCmd::Leave { session_id }).await;
    }

    /// Connected-client count; zero once the room has exited.
    pub async fn client_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomCmd::ClientCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Flush and shut the room down. Already-destroyed rooms report success.
    pub async fn destroy(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomCmd::Destroy { if_empty: false, reply }).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(true)).map(|_| ())
    }

    /// Destroy only if no client is connected. Returns whether the room was
    /// destroyed; the check happens inside the actor, so a join that beat
    /// this command into the queue makes it decline.
    pub(crate) async fn destroy_if_empty(&self) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomCmd::Destroy { if_empty: true, reply }).await.is_err() {
            return Ok(true);
        }
        rx.await.unwrap_or(Ok(true))
    }
}

/// A connected client as the room sees it.
struct ClientSession {
    identity: Identity,
    outbound: mpsc::Sender<Arc<Vec<u8>>>,
}

/// Per-room persistence settings, carved out of the engine config.
#[derive(Debug, Clone)]
pub(crate) struct RoomSettings {
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

pub(crate) struct Room {
    id: String,
    doc: CrdtDoc,
    clients: HashMap<Uuid, ClientSession>,
    dirty: bool,
    /// Pending debounced flush, if any
    persist_deadline: Option<Instant>,
    /// A detached snapshot write has not settled yet. At most one write is
    /// in flight at a time; a debounce firing meanwhile is deferred so a
    /// retrying older write can never land after a newer one.
    flush_in_flight: bool,
    store: Arc<dyn SnapshotStore>,
    settings: RoomSettings,
    events: mpsc::UnboundedSender<RoomEvent>,
    /// Clone of our own queue, for background flush completions
    self_tx: mpsc::Sender<RoomCmd>,
}

impl Room {
    /// Spawn the room actor and return its handle.
    ///
    /// The actor loads the persisted snapshot before serving commands;
    /// joins arriving meanwhile queue in the channel. A missing or corrupt
    /// snapshot degrades to an empty document rather than wedging the room.
    pub(crate) fn spawn(
        id: String,
        store: Arc<dyn SnapshotStore>,
        settings: RoomSettings,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> RoomHandle {
        let (tx, rx) = mpsc::channel(256);
        let handle = RoomHandle { id: Arc::from(id.as_str()), tx: tx.clone() };
        tokio::spawn(run(id, rx, tx, store, settings, events));
        handle
    }
}

async fn run(
    id: String,
    mut rx: mpsc::Receiver<RoomCmd>,
    self_tx: mpsc::Sender<RoomCmd>,
    store: Arc<dyn SnapshotStore>,
    settings: RoomSettings,
    events: mpsc::UnboundedSender<RoomEvent>,
) {
    // Loading
    let doc = match store.load(&id) {
        Ok(Some(snapshot)) => match CrdtDoc::from_snapshot(&snapshot) {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("room '{id}': corrupt snapshot, starting empty: {e}");
                CrdtDoc::new()
            }
        },
        Ok(None) => CrdtDoc::new(),
        Err(e) => {
            log::error!("room '{id}': snapshot load failed, starting empty: {e}");
            CrdtDoc::new()
        }
    };

    let mut room = Room {
        id,
        doc,
        clients: HashMap::new(),
        dirty: false,
        persist_deadline: None,
        flush_in_flight: false,
        store,
        settings,
        events,
        self_tx,
    };

    // Active
    loop {
        let deadline = room.persist_deadline;
        let debounce_fired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(RoomCmd::Destroy { if_empty, reply }) => {
                        if if_empty && !room.clients.is_empty() {
                            let _ = reply.send(Ok(false));
                            continue;
                        }
                        // Draining: let any outstanding write settle first,
                        // so it cannot land after the final flush
                        room.await_inflight_flush(&mut rx).await;
                        let result = room.final_flush().await.map(|()| true);
                        // Close stragglers: dropping their senders ends the pumps
                        room.clients.clear();
                        let _ = reply.send(result);
                        break;
                    }
                    Some(cmd) => room.handle(cmd),
                    None => break,
                }
            }
            _ = debounce_fired => {
                room.flush_background();
            }
        }
    }

    // Draining: refuse whatever is still queued
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        refuse(cmd);
    }
    log::debug!("room '{}' destroyed", room.id);
}

fn refuse(cmd: RoomCmd) {
    match cmd {
        RoomCmd::Join { reply, .. } => {
            let _ = reply.send(Err(RoomError::Closed));
        }
        RoomCmd::Destroy { reply, .. } => {
            let _ = reply.send(Ok(true));
        }
        RoomCmd::ClientCount { reply } => {
            let _ = reply.send(0);
        }
        _ => {}
    }
}

impl Room {
    /// Process one command. `Destroy` is handled by the actor loop itself.
    fn handle(&mut self, cmd: RoomCmd) {
        match cmd {
            RoomCmd::Join { session_id, identity, state_vector, outbound, reply } => {
                self.join(session_id, identity, state_vector, outbound, reply);
            }
            RoomCmd::Update { from, update } => {
                self.update(from, update);
            }
            RoomCmd::Resync { from, state_vector } => {
                self.resync(from, state_vector);
            }
            RoomCmd::Leave { session_id } => {
                self.leave(session_id);
            }
            RoomCmd::Destroy { reply, .. } => {
                // Intercepted by the actor loop; kept for exhaustiveness
                let _ = reply.send(Ok(true));
            }
            RoomCmd::ClientCount { reply } => {
                let _ = reply.send(self.clients.len());
            }
            RoomCmd::FlushDone { result } => {
                self.flush_finished(result);
            }
        }
    }

    fn join(
        &mut self,
        session_id: Uuid,
        identity: Identity,
        state_vector: Option<Vec<u8>>,
        outbound: mpsc::Sender<Arc<Vec<u8>>>,
        reply: oneshot::Sender<Result<Vec<u8>, RoomError>>,
    ) {
        let payload = match &state_vector {
            Some(sv) => match self.doc.diff(sv) {
                Ok(diff) => diff,
                Err(e) => {
                    let _ = reply.send(Err(RoomError::Protocol(e.to_string())));
                    return;
                }
            },
            None => self.doc.encode_state(),
        };

        let frame = match Frame::sync_step2(payload).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = reply.send(Err(RoomError::Protocol(e.to_string())));
                return;
            }
        };

        log::info!("session {session_id} ({identity}) joined room '{}'", self.id);
        self.clients.insert(session_id, ClientSession { identity, outbound });
        let _ = reply.send(Ok(frame));
    }

    fn update(&mut self, from: Uuid, update: Vec<u8>) {
        if !self.clients.contains_key(&from) {
            log::debug!("room '{}': update from unknown session {from}, dropped", self.id);
            return;
        }

        if let Err(e) = self.doc.apply_update(&update) {
            // Scoped to the offender; shared state is untouched
            log::warn!("room '{}': rejected update from session {from}: {e}", self.id);
            self.send_to(from, Frame::rejected(&e.to_string()));
            return;
        }

        self.dirty = true;
        self.persist_deadline = Some(Instant::now() + self.settings.debounce);

        // Fan out in application order, never back to the sender
        let encoded = match Frame::update(update).encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("room '{}': broadcast encode failed: {e}", self.id);
                return;
            }
        };

        // A full queue means the client cannot keep up; a closed one means
        // its transport already died. Either way the session is gone.
        let mut dropped = Vec::new();
        for (&session_id, client) in &self.clients {
            if session_id == from {
                continue;
            }
            if client.outbound.try_send(encoded.clone()).is_err() {
                dropped.push(session_id);
            }
        }

        for session_id in dropped {
            log::warn!(
                "room '{}': session {session_id} outbound queue full or closed, disconnecting",
                self.id
            );
            self.clients.remove(&session_id);
        }
        if self.clients.is_empty() {
            self.on_empty();
        }
    }

    fn resync(&mut self, from: Uuid, state_vector: Vec<u8>) {
        let diff = match self.doc.diff(&state_vector) {
            Ok(diff) => diff,
            Err(e) => {
                log::warn!("room '{}': bad resync from session {from}: {e}", self.id);
                self.send_to(from, Frame::rejected(&e.to_string()));
                return;
            }
        };
        self.send_to(from, Frame::sync_step2(diff));
    }

    fn leave(&mut self, session_id: Uuid) {
        if let Some(client) = self.clients.remove(&session_id) {
            log::info!("session {session_id} ({}) left room '{}'", client.identity, self.id);
            if self.clients.is_empty() {
                self.on_empty();
            }
        }
    }

    /// Last client gone: best-effort immediate persist, then ask the
    /// registry to schedule eviction.
    fn on_empty(&mut self) {
        self.persist_deadline = None;
        if self.dirty && !self.flush_in_flight {
            let snapshot = self.doc.encode_state();
            match self.store.save(&self.id, &snapshot) {
                Ok(()) => {
                    self.dirty = false;
                    log::debug!("room '{}': persisted on drain", self.id);
                }
                Err(e) => {
                    // Keep dirty; the final destroy flush retries
                    log::error!("room '{}': drain persist failed: {e}", self.id);
                }
            }
        } else if self.dirty {
            // The outstanding write settles first; re-arm so this state
            // still lands before eviction destroys the room
            self.persist_deadline = Some(Instant::now() + self.settings.debounce);
        }
        let _ = self.events.send(RoomEvent::Idle { room_id: self.id.clone() });
    }

    /// Forced flush on destroy, with the full retry policy.
    async fn final_flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let snapshot = self.doc.encode_state();
        let result =
            save_with_retry(self.store.as_ref(), &self.id, &snapshot, &self.settings.retry).await;
        if result.is_ok() {
            self.dirty = false;
        }
        result
    }

    /// Debounce fired: encode inside the actor (cheap), write in a detached
    /// task so persistence never blocks update application. At most one
    /// write is in flight; while one is outstanding the debounce re-arms
    /// and the document stays dirty.
    fn flush_background(&mut self) {
        self.persist_deadline = None;
        if !self.dirty {
            return;
        }
        if self.flush_in_flight {
            self.persist_deadline = Some(Instant::now() + self.settings.debounce);
            return;
        }
        let snapshot = self.doc.encode_state();
        self.dirty = false;
        self.flush_in_flight = true;

        let store = self.store.clone();
        let id = self.id.clone();
        let retry = self.settings.retry.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = save_with_retry(store.as_ref(), &id, &snapshot, &retry).await;
            let _ = self_tx.send(RoomCmd::FlushDone { result }).await;
        });
    }

    /// A detached write settled. On failure the document is dirty again and
    /// the debounce re-arms, so a later cycle retries with current state.
    fn flush_finished(&mut self, result: Result<(), StoreError>) {
        self.flush_in_flight = false;
        match result {
            Ok(()) => log::debug!("room '{}': snapshot persisted", self.id),
            Err(e) => {
                log::error!("room '{}': snapshot persist failed: {e}", self.id);
                self.dirty = true;
                self.persist_deadline = Some(Instant::now() + self.settings.debounce);
            }
        }
    }

    /// Destroy path: block on the outstanding write, if any. The write task
    /// holds a queue sender, so its completion is always deliverable here.
    async fn await_inflight_flush(&mut self, rx: &mut mpsc::Receiver<RoomCmd>) {
        while self.flush_in_flight {
            match rx.recv().await {
                Some(RoomCmd::FlushDone { result }) => self.flush_finished(result),
                Some(other) => refuse(other),
                None => return,
            }
        }
    }

    fn send_to(&mut self, session_id: Uuid, frame: Frame) {
        let Some(client) = self.clients.get(&session_id) else {
            return;
        };
        let encoded = match frame.encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("room '{}': frame encode failed: {e}", self.id);
                return;
            }
        };
        if client.outbound.try_send(encoded).is_err() {
            log::warn!(
                "room '{}': session {session_id} outbound queue full or closed, disconnecting",
                self.id
            );
            self.clients.remove(&session_id);
            if self.clients.is_empty() {
                self.on_empty();
            }
        }
    }
}
