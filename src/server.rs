//! WebSocket gateway: handshake, auth, and the per-connection pump.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /room/{id}?token=…
//! Client B ──┼──► CollabServer ──► RoomRegistry ──► Room actor
//! Client C ──┘        │                                │
//!                     │   bounded outbound queue       │
//!                     ◄────────────────────────────────┘
//! ```
//!
//! Bad requests never reach a room: route and token are checked inside the
//! WebSocket handshake callback, so rejects are plain HTTP responses (404
//! for an unknown path, 401 for auth) and no protocol state is set up.
//!
//! After the handshake each connection runs one pump task that forwards
//! decoded frames to the room and drains the room's outbound queue into
//! the socket. The pump never blocks on a slow peer: the room drops a
//! client whose queue overflows, which closes the queue and ends the pump.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use percent_encoding::percent_decode_str;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use crate::auth::{AuthError, Identity, TokenVerifier};
use crate::config::EngineConfig;
use crate::protocol::{Frame, FrameType};
use crate::registry::RoomRegistry;
use crate::room::{RoomError, RoomHandle};
use crate::store::SnapshotStore;

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    /// Listener could not bind or accept
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection {
    /// Path is not `/room/{room-id}`
    NotFound,
    /// Token required and absent
    MissingToken,
    /// Token present but failed verification
    BadToken(AuthError),
}

impl Rejection {
    fn status(&self) -> StatusCode {
        match self {
            Rejection::NotFound => StatusCode::NOT_FOUND,
            Rejection::MissingToken | Rejection::BadToken(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::NotFound => write!(f, "No such endpoint"),
            Rejection::MissingToken => write!(f, "Missing token"),
            Rejection::BadToken(e) => write!(f, "{e}"),
        }
    }
}

/// Extract the room id and optional token from the request URI.
///
/// The only routable path is `/room/{room-id}`; the id is one
/// percent-encoded segment (the decoded value may contain anything,
/// including `/`). The token rides in the `token` query parameter.
fn parse_route(uri: &str) -> Result<(String, Option<String>), Rejection> {
    let url = Url::parse(&format!("ws://gateway{uri}")).map_err(|_| Rejection::NotFound)?;

    let mut segments = url.path_segments().ok_or(Rejection::NotFound)?;
    let (prefix, encoded_id) = match (segments.next(), segments.next(), segments.next()) {
        (Some(prefix), Some(id), None) => (prefix, id),
        _ => return Err(Rejection::NotFound),
    };
    if prefix != "room" || encoded_id.is_empty() {
        return Err(Rejection::NotFound);
    }

    let room_id = percent_decode_str(encoded_id)
        .decode_utf8()
        .map_err(|_| Rejection::NotFound)?
        .into_owned();

    let token = url
        .query_pairs()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned());

    Ok((room_id, token))
}

/// Gateway counters; monotonic except for the active gauge.
#[derive(Default)]
struct GatewayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
}

/// Point-in-time gateway statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub active_rooms: usize,
}

/// The collaboration gateway.
pub struct CollabServer {
    config: EngineConfig,
    registry: RoomRegistry,
    verifier: Arc<dyn TokenVerifier>,
    stats: Arc<GatewayStats>,
}

impl CollabServer {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SnapshotStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let registry = RoomRegistry::new(store, &config);
        Self { config, registry, verifier, stats: Arc::new(GatewayStats::default()) }
    }

    /// The shared room registry.
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count(),
        }
    }

    /// Accept connections until the process is killed.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then flush and exit.
    ///
    /// Shutdown order: stop accepting, destroy every room (final snapshot
    /// flush included), give up after the configured deadline. Dropped
    /// rooms close their clients' outbound queues, which ends the pumps.
    pub async fn run_until(
        &self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Gateway listening on {}", self.config.bind_addr);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let registry = self.registry.clone();
                    let verifier = self.verifier.clone();
                    let config = self.config.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(
                            stream, addr, registry, verifier, config, stats,
                        )
                        .await
                        {
                            log::debug!("Connection from {addr} ended with error: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, draining rooms");
                    break;
                }
            }
        }
        drop(listener);

        match tokio::time::timeout(self.config.shutdown_deadline, self.registry.destroy_all())
            .await
        {
            Ok(Ok(())) => log::info!("All rooms flushed, shutting down"),
            Ok(Err(e)) => log::error!("Shutdown flush incomplete: {e}"),
            Err(_) => log::error!(
                "Shutdown flush exceeded {:?}, exiting anyway",
                self.config.shutdown_deadline
            ),
        }
        Ok(())
    }
}

/// One connection, handshake to close.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: RoomRegistry,
    verifier: Arc<dyn TokenVerifier>,
    config: EngineConfig,
    stats: Arc<GatewayStats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Route and authenticate inside the handshake so rejects are plain
    // HTTP responses and never allocate room state.
    let mut admitted: Option<(String, Identity)> = None;
    let callback = |req: &Request, resp: Response| {
        let outcome = parse_route(&req.uri().to_string()).and_then(|(room_id, token)| {
            let identity = match token {
                Some(token) => verifier.verify(&token).map_err(Rejection::BadToken)?,
                None if config.permissive_auth => Identity::anonymous(),
                None => return Err(Rejection::MissingToken),
            };
            Ok((room_id, identity))
        });
        match outcome {
            Ok(route) => {
                admitted = Some(route);
                Ok(resp)
            }
            Err(rejection) => {
                log::info!("Rejected handshake from {addr}: {rejection}");
                let mut resp = ErrorResponse::new(Some(rejection.to_string()));
                *resp.status_mut() = rejection.status();
                Err(resp)
            }
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
    };
    let Some((room_id, identity)) = admitted else {
        return Ok(());
    };

    stats.total_connections.fetch_add(1, Ordering::Relaxed);
    stats.active_connections.fetch_add(1, Ordering::Relaxed);
    let result =
        pump(ws_stream, addr, &room_id, identity, &registry, &config).await;
    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

/// Join the room, forward frames both ways until either side closes.
async fn pump(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    addr: SocketAddr,
    room_id: &str,
    identity: Identity,
    registry: &RoomRegistry,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let session_id = Uuid::new_v4();

    let (room, outbound_rx, initial) =
        join_room(registry, room_id, session_id, identity, config).await?;
    log::info!("WebSocket session {session_id} from {addr} on room '{room_id}'");

    // However the session ends, transport error included, the room must see
    // the Leave or the session lingers in its client set
    let result = forward(ws_stream, session_id, &room, outbound_rx, initial, room_id).await;
    room.leave(session_id).await;
    result
}

/// Drive one joined session until either side closes or the socket errors.
async fn forward(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    session_id: Uuid,
    room: &RoomHandle,
    mut outbound_rx: mpsc::Receiver<Arc<Vec<u8>>>,
    initial: Vec<u8>,
    room_id: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Full state (or diff) goes out before any broadcast frame
    ws_sender.send(Message::Binary(initial.into())).await?;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = match Frame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Undecodable frame from session {session_id}: {e}");
                                let reject = Frame::rejected(&e.to_string()).encode()?;
                                ws_sender.send(Message::Binary(reject.into())).await?;
                                continue;
                            }
                        };
                        match frame.frame_type {
                            FrameType::Update => {
                                if room.apply_update(session_id, frame.payload).await.is_err() {
                                    break;
                                }
                            }
                            FrameType::SyncStep1 => {
                                if room.resync(session_id, frame.payload).await.is_err() {
                                    break;
                                }
                            }
                            other => {
                                log::debug!("Ignoring {other:?} frame from session {session_id}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Session {session_id} closed by peer");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on session {session_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            frame = outbound_rx.recv() => {
                match frame {
                    Some(bytes) => {
                        ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                    }
                    None => {
                        // Room dropped us: destroyed, or our queue overflowed
                        log::info!("Session {session_id} disconnected by room '{room_id}'");
                        let _ = ws_sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Policy,
                                reason: "disconnected by server".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Resolve and join, retrying once if the room closed between resolution
/// and the join landing in its queue.
async fn join_room(
    registry: &RoomRegistry,
    room_id: &str,
    session_id: Uuid,
    identity: Identity,
    config: &EngineConfig,
) -> Result<(RoomHandle, mpsc::Receiver<Arc<Vec<u8>>>, Vec<u8>), RoomError> {
    for _ in 0..2 {
        let room = registry
            .get_or_create(room_id)
            .map_err(|e| RoomError::Protocol(e.to_string()))?;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.client_queue_capacity);
        match room.join(session_id, identity.clone(), None, outbound_tx).await {
            Ok(initial) => return Ok((room, outbound_rx, initial)),
            Err(RoomError::Closed) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(RoomError::Closed)
}
