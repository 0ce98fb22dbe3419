//! # coedit — Real-time collaborative document engine
//!
//! Server-side engine for multiplayer document editing over WebSocket,
//! using CRDT synchronization with durable snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  WS /room/{id}?token  ┌──────────────┐
//! │ Editor      │ ◄─────────────────────► │ CollabServer │
//! │ (per user)  │      Binary frames      │ (gateway)    │
//! └─────────────┘                         └──────┬───────┘
//!                                                │ get_or_create
//!                                         ┌──────┴───────┐
//!                                         │ RoomRegistry │
//!                                         │ (id → room)  │
//!                                         └──────┬───────┘
//!                                                │ mpsc commands
//!                                         ┌──────┴───────┐
//!                                         │ Room actor   │
//!                                         │ CrdtDoc +    │
//!                                         │ client set   │
//!                                         └──────┬───────┘
//!                                                │ debounced save
//!                                         ┌──────┴───────┐
//!                                         │ SnapshotStore│
//!                                         │ (RocksDB/LZ4)│
//!                                         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire frames (bincode-encoded [`Frame`])
//! - [`document`] — CRDT document wrapper around Yrs
//! - [`room`] — Room actor: single-writer mutation, fan-out, persistence
//! - [`registry`] — Room lifecycle: resolution, idle eviction, shutdown
//! - [`store`] — Durable snapshot store (RocksDB + LZ4)
//! - [`auth`] — Token verification seam
//! - [`server`] — WebSocket gateway and connection pumps
//!
//! ## Guarantees
//!
//! - At most one live room per document id; that room's actor is the only
//!   writer of its document
//! - Updates broadcast in application order, never echoed to the sender
//! - A malformed update affects only the client that sent it
//! - Dirty documents are flushed on idle, on eviction, and on shutdown

pub mod auth;
pub mod config;
pub mod document;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use auth::{AcceptAll, AuthError, Identity, SharedSecretVerifier, TokenVerifier};
pub use config::EngineConfig;
pub use document::{CrdtDoc, DocError};
pub use protocol::{Frame, FrameType, ProtocolError};
pub use registry::{RegistryError, RegistryStats, RoomRegistry};
pub use room::{RoomError, RoomHandle};
pub use server::{CollabServer, ServerError, ServerStats};
pub use store::{
    MemoryStore, RetryPolicy, RocksStore, SnapshotMeta, SnapshotStore, StoreConfig, StoreError,
};
