//! Binary wire frames for the collaboration stream.
//!
//! Every WebSocket binary message carries one bincode-encoded [`Frame`]
//! with a leading type tag:
//!
//! ```text
//! ┌────────────┬──────────┐
//! │ frame_type │ payload  │
//! │ 1 byte     │ variable │
//! └────────────┴──────────┘
//! ```
//!
//! Payload contents are opaque Yrs sync material (state vectors, updates)
//! except for [`FrameType::Rejected`], which carries a UTF-8 reason so the
//! editor can resynchronize instead of silently diverging. Sync follows the
//! CRDT library's two-step protocol: the client may send its state vector
//! (`SyncStep1`) and gets back a diff (`SyncStep2`); mutations travel as
//! `Update` frames in both directions.

use serde::{Deserialize, Serialize};

/// Frame types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Client → server: state vector announcing what the peer already has
    SyncStep1 = 1,
    /// Server → client: full state or diff response
    SyncStep2 = 2,
    /// Incremental CRDT update (either direction)
    Update = 3,
    /// Server → client: the previous frame was rejected
    Rejected = 4,
}

/// A single wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    /// State-vector announcement (client side of the sync handshake).
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self { frame_type: FrameType::SyncStep1, payload: state_vector }
    }

    /// Full state or diff (server side of the sync handshake).
    pub fn sync_step2(state: Vec<u8>) -> Self {
        Self { frame_type: FrameType::SyncStep2, payload: state }
    }

    /// Incremental document update.
    pub fn update(update: Vec<u8>) -> Self {
        Self { frame_type: FrameType::Update, payload: update }
    }

    /// Rejection notice for the offending client only.
    pub fn rejected(reason: &str) -> Self {
        Self { frame_type: FrameType::Rejected, payload: reason.as_bytes().to_vec() }
    }

    /// The rejection reason, for `Rejected` frames.
    pub fn reason(&self) -> Option<String> {
        if self.frame_type != FrameType::Rejected {
            return None;
        }
        Some(String::from_utf8_lossy(&self.payload).into_owned())
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "Frame encode error: {e}"),
            ProtocolError::Decode(e) => write!(f, "Frame decode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
