//! CRDT document wrapper.
//!
//! The merge algebra is Yrs, consumed as a black box. This module pins the
//! narrow integration contract the rest of the engine is allowed to use:
//! apply a remote update, produce an update since a peer's state vector,
//! and encode/decode full state. Nothing outside this module touches
//! `yrs` types; a room owns exactly one [`CrdtDoc`] and is its only writer.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

/// Document errors. All are scoped to the offending input; the document
/// itself is never left in a corrupt state.
#[derive(Debug, Clone)]
pub enum DocError {
    /// Update payload could not be decoded
    BadUpdate(String),
    /// State vector could not be decoded
    BadStateVector(String),
    /// Decoded update was rejected by the merge
    Merge(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::BadUpdate(e) => write!(f, "Malformed update: {e}"),
            DocError::BadStateVector(e) => write!(f, "Malformed state vector: {e}"),
            DocError::Merge(e) => write!(f, "Merge failed: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// A single replicated document.
pub struct CrdtDoc {
    doc: yrs::Doc,
}

impl CrdtDoc {
    /// Create an empty document.
    pub fn new() -> Self {
        Self { doc: yrs::Doc::new() }
    }

    /// Restore a document from a persisted full-state snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, DocError> {
        let doc = Self::new();
        doc.apply_update(snapshot)?;
        Ok(doc)
    }

    /// Decode and merge a remote update.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocError> {
        let update = Update::decode_v1(update).map_err(|e| DocError::BadUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| DocError::Merge(e.to_string()))
    }

    /// Encode everything the peer behind `state_vector` is missing.
    pub fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocError::BadStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Encode the full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode this document's state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Whether the document has no content at all.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        txn.state_vector() == StateVector::default()
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}
