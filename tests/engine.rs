//! End-to-end tests: real server, real WebSocket clients.
//!
//! Each test starts a gateway on a free port and drives it through raw
//! `tokio-tungstenite` connections, verifying handshake policy, sync,
//! convergence, and the persistence lifecycle.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use coedit::{
    CollabServer, EngineConfig, Frame, FrameType, MemoryStore, RocksStore, SharedSecretVerifier,
    SnapshotStore, StoreConfig, TokenVerifier,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, Text, Transact, Update, WriteTxn};

const SECRET: &str = "s3cret";

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> EngineConfig {
    EngineConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        debounce: Duration::from_millis(80),
        idle_eviction: Duration::from_secs(60),
        ..EngineConfig::default()
    }
}

/// Start a server; the returned sender triggers graceful shutdown and the
/// handle resolves once the shutdown flush is done.
async fn start_server(
    store: Arc<dyn SnapshotStore>,
    config: EngineConfig,
) -> (u16, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let port: u16 = config.bind_addr.rsplit(':').next().unwrap().parse().unwrap();
    let verifier: Arc<dyn TokenVerifier> = Arc::new(SharedSecretVerifier::new(SECRET));
    let server = CollabServer::new(config, store, verifier);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });
    // Give the listener time to bind
    sleep(Duration::from_millis(50)).await;
    (port, shutdown_tx, handle)
}

async fn start_default_server() -> (u16, Arc<MemoryStore>, oneshot::Sender<()>) {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let (port, shutdown, _handle) = start_server(store.clone(), test_config(port)).await;
    (port, store, shutdown)
}

fn token_for(user: &str) -> String {
    let expiry = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600;
    format!("{user}:{expiry}:{SECRET}")
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A scripted editor peer over a live WebSocket.
struct Editor {
    doc: yrs::Doc,
    ws: Socket,
}

impl Editor {
    /// Connect, authenticate, and absorb the initial full-state frame.
    async fn connect(port: u16, room: &str, user: &str) -> Self {
        let url = format!("ws://127.0.0.1:{port}/room/{room}?token={}", token_for(user));
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let frame = next_frame(&mut ws).await;
        assert_eq!(frame.frame_type, FrameType::SyncStep2);
        let doc = yrs::Doc::new();
        apply(&doc, &frame.payload);
        Self { doc, ws }
    }

    /// Append text locally and send the incremental update.
    async fn edit(&mut self, text: &str) {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let t = txn.get_or_insert_text("body");
            let len = t.get_string(&txn).len() as u32;
            t.insert(&mut txn, len, text);
        }
        let update = self.doc.transact().encode_diff_v1(&before);
        self.send_update(update).await;
    }

    async fn send_update(&mut self, update: Vec<u8>) {
        let bytes = Frame::update(update).encode().unwrap();
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Receive one frame and, if it is an update, merge it.
    async fn recv(&mut self) -> Frame {
        let frame = next_frame(&mut self.ws).await;
        if frame.frame_type == FrameType::Update || frame.frame_type == FrameType::SyncStep2 {
            apply(&self.doc, &frame.payload);
        }
        frame
    }

    fn text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text("body").map(|t| t.get_string(&txn)).unwrap_or_default()
    }
}

fn apply(doc: &yrs::Doc, update: &[u8]) {
    let update = Update::decode_v1(update).unwrap();
    let mut txn = doc.transact_mut();
    txn.apply_update(update).unwrap();
}

async fn next_frame(ws: &mut Socket) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("no transport error");
        match msg {
            Message::Binary(data) => return Frame::decode(&data).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Handshake rejections surface as HTTP error responses.
fn http_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_path_rejected_with_404() {
    let (port, _store, _shutdown) = start_default_server().await;

    let url = format!("ws://127.0.0.1:{port}/documents/doc-1?token={}", token_for("alice"));
    let err = tokio_tungstenite::connect_async(&url).await.unwrap_err();
    assert_eq!(http_status(err), 404);
}

#[tokio::test]
async fn test_missing_token_rejected_with_401_in_strict_mode() {
    let (port, _store, _shutdown) = start_default_server().await;

    let url = format!("ws://127.0.0.1:{port}/room/doc-1");
    let err = tokio_tungstenite::connect_async(&url).await.unwrap_err();
    assert_eq!(http_status(err), 401);
}

#[tokio::test]
async fn test_invalid_and_expired_tokens_rejected_with_401() {
    let (port, _store, _shutdown) = start_default_server().await;

    let bad = format!("ws://127.0.0.1:{port}/room/doc-1?token=alice:9999999999:guess");
    let err = tokio_tungstenite::connect_async(&bad).await.unwrap_err();
    assert_eq!(http_status(err), 401);

    let expired = format!("ws://127.0.0.1:{port}/room/doc-1?token=alice:1000:{SECRET}");
    let err = tokio_tungstenite::connect_async(&expired).await.unwrap_err();
    assert_eq!(http_status(err), 401);
}

#[tokio::test]
async fn test_permissive_mode_admits_tokenless_connections() {
    let port = free_port().await;
    let config = EngineConfig { permissive_auth: true, ..test_config(port) };
    let (port, _shutdown, _handle) =
        start_server(Arc::new(MemoryStore::new()), config).await;

    let url = format!("ws://127.0.0.1:{port}/room/doc-1");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.frame_type, FrameType::SyncStep2);
}

#[tokio::test]
async fn test_two_editors_converge() {
    let (port, _store, _shutdown) = start_default_server().await;

    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    let mut bob = Editor::connect(port, "doc-1", "bob").await;

    alice.edit("hello ").await;
    let frame = bob.recv().await;
    assert_eq!(frame.frame_type, FrameType::Update);

    bob.edit("world").await;
    let frame = alice.recv().await;
    assert_eq!(frame.frame_type, FrameType::Update);

    assert_eq!(alice.text(), "hello world");
    assert_eq!(bob.text(), "hello world");
}

#[tokio::test]
async fn test_sender_receives_no_echo() {
    let (port, _store, _shutdown) = start_default_server().await;

    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    let mut bob = Editor::connect(port, "doc-1", "bob").await;

    alice.edit("only for bob").await;
    bob.recv().await;

    let echo = timeout(Duration::from_millis(300), alice.ws.next()).await;
    assert!(echo.is_err(), "sender must not receive its own update");
}

#[tokio::test]
async fn test_late_joiner_receives_accumulated_state() {
    let (port, _store, _shutdown) = start_default_server().await;

    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    alice.edit("first ").await;
    alice.edit("second").await;
    // Let the room apply before the join snapshot is cut
    sleep(Duration::from_millis(100)).await;

    let bob = Editor::connect(port, "doc-1", "bob").await;
    assert_eq!(bob.text(), "first second");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (port, _store, _shutdown) = start_default_server().await;

    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    let mut carol = Editor::connect(port, "doc-2", "carol").await;

    alice.edit("doc-1 only").await;
    let leaked = timeout(Duration::from_millis(300), carol.ws.next()).await;
    assert!(leaked.is_err(), "updates must not cross rooms");
}

#[tokio::test]
async fn test_malformed_update_rejects_sender_only() {
    let (port, _store, _shutdown) = start_default_server().await;

    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    let mut bob = Editor::connect(port, "doc-1", "bob").await;

    alice.send_update(vec![0xFF, 0xFE, 0xFD]).await;
    let frame = alice.recv().await;
    assert_eq!(frame.frame_type, FrameType::Rejected);

    let leaked = timeout(Duration::from_millis(300), bob.ws.next()).await;
    assert!(leaked.is_err(), "bad update must not reach other clients");

    // The session and the room both survive
    alice.edit("recovered").await;
    let frame = bob.recv().await;
    assert_eq!(frame.frame_type, FrameType::Update);
    assert_eq!(bob.text(), "recovered");
}

#[tokio::test]
async fn test_sync_step1_returns_diff() {
    let (port, _store, _shutdown) = start_default_server().await;

    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    alice.edit("resync target").await;
    sleep(Duration::from_millis(100)).await;

    let mut bob = Editor::connect(port, "doc-1", "bob").await;
    let sv = bob.doc.transact().state_vector().encode_v1();
    let bytes = Frame::sync_step1(sv).encode().unwrap();
    bob.ws.send(Message::Binary(bytes.into())).await.unwrap();

    let frame = bob.recv().await;
    assert_eq!(frame.frame_type, FrameType::SyncStep2);
    assert_eq!(bob.text(), "resync target");
}

#[tokio::test]
async fn test_update_burst_collapses_to_one_save() {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        debounce: Duration::from_millis(200),
        ..test_config(port)
    };
    let (port, _shutdown, _handle) = start_server(store.clone(), config).await;

    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    for i in 0..50 {
        alice.edit(&format!("{i} ")).await;
    }
    assert_eq!(store.save_count(), 0, "no save while the burst is in flight");

    sleep(Duration::from_millis(700)).await;
    assert_eq!(store.save_count(), 1, "debounce collapses the burst to one save");

    let saved = store.peek("doc-1").unwrap();
    let doc = yrs::Doc::new();
    apply(&doc, &saved);
    let txn = doc.transact();
    assert_eq!(txn.get_text("body").unwrap().get_string(&txn), alice.text());
}

#[tokio::test]
async fn test_disconnect_of_last_client_flushes_immediately() {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    // Debounce far beyond the test: only the leave can explain a prompt save
    let config = EngineConfig {
        debounce: Duration::from_secs(60),
        ..test_config(port)
    };
    let (port, _shutdown, _handle) = start_server(store.clone(), config).await;

    {
        let mut alice = Editor::connect(port, "doc-1", "alice").await;
        alice.edit("persist me").await;
        sleep(Duration::from_millis(50)).await;
        alice.ws.close(None).await.unwrap();
    }

    sleep(Duration::from_millis(300)).await;
    assert!(store.peek("doc-1").is_some(), "dirty room flushes when it empties");
}

#[tokio::test]
async fn test_abrupt_disconnect_does_not_leak_the_room() {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        debounce: Duration::from_millis(50),
        idle_eviction: Duration::from_millis(200),
        ..test_config(port)
    };
    let (port, _shutdown, _handle) = start_server(store.clone(), config).await;

    // Alice's transport dies without a Close frame ever being sent
    let alice = Editor::connect(port, "doc-1", "alice").await;
    let mut bob = Editor::connect(port, "doc-1", "bob").await;
    drop(alice);
    sleep(Duration::from_millis(100)).await;

    bob.edit("after the crash").await;
    sleep(Duration::from_millis(150)).await;
    bob.ws.close(None).await.unwrap();

    // The dead session must not keep the room occupied: the idle window
    // elapses and the room is evicted
    sleep(Duration::from_millis(600)).await;
    let loads_before = store.load_count();
    let carol = Editor::connect(port, "doc-1", "carol").await;
    assert_eq!(carol.text(), "after the crash");
    assert_eq!(store.load_count(), loads_before + 1, "fresh room reloaded the snapshot");
}

#[tokio::test]
async fn test_graceful_shutdown_flushes_dirty_rooms() {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        debounce: Duration::from_secs(60),
        ..test_config(port)
    };
    let (port, shutdown, handle) = start_server(store.clone(), config).await;

    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    alice.edit("unsaved at shutdown").await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(store.save_count(), 0);

    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(store.peek("doc-1").is_some(), "shutdown forces the final flush");

    // Listener is gone
    let url = format!("ws://127.0.0.1:{port}/room/doc-1?token={}", token_for("bob"));
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}

#[tokio::test]
async fn test_full_room_lifecycle() {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        debounce: Duration::from_millis(50),
        idle_eviction: Duration::from_millis(200),
        ..test_config(port)
    };
    let (port, _shutdown, _handle) = start_server(store.clone(), config).await;

    // A joins the empty room and receives empty state
    let mut alice = Editor::connect(port, "doc-1", "alice").await;
    assert_eq!(alice.text(), "");

    // A edits; the debounce flushes it
    alice.edit("u1").await;
    sleep(Duration::from_millis(250)).await;
    assert_eq!(store.save_count(), 1);

    // B joins and receives A's edit, not the empty default
    let mut bob = Editor::connect(port, "doc-1", "bob").await;
    assert_eq!(bob.text(), "u1");

    // Both disconnect; the idle window elapses and the room is evicted
    alice.ws.close(None).await.unwrap();
    bob.ws.close(None).await.unwrap();
    sleep(Duration::from_millis(600)).await;

    // A fresh resolution reloads from the store rather than starting empty
    let loads_before = store.load_count();
    let carol = Editor::connect(port, "doc-1", "carol").await;
    assert_eq!(carol.text(), "u1");
    assert_eq!(store.load_count(), loads_before + 1);
}

#[tokio::test]
async fn test_document_survives_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db");

    {
        let port = free_port().await;
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let (port, shutdown, handle) = start_server(store, test_config(port)).await;

        let mut alice = Editor::connect(port, "doc-1", "alice").await;
        alice.edit("durable words").await;
        sleep(Duration::from_millis(100)).await;
        shutdown.send(()).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    let port = free_port().await;
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let (port, _shutdown, _handle) = start_server(store, test_config(port)).await;

    let bob = Editor::connect(port, "doc-1", "bob").await;
    assert_eq!(bob.text(), "durable words");
}
