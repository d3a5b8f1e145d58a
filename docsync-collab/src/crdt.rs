//! Replicated document state for one document name.
//!
//! Wraps a Yrs `Doc`. Yrs guarantees that applying the same update twice, or
//! two updates in either order, converges to the same state. Updates that the
//! decoder rejects never reach the document; anything it accepts is handed to
//! Yrs as is, so the decoder is the only gate.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update};

/// Result of integrating a remote update.
#[derive(Debug, Clone)]
pub struct AppliedUpdate {
    /// Delta to forward to other replicas.
    pub delta: Vec<u8>,
    /// Whether the local state vector moved (false for duplicates and
    /// delete-only updates).
    pub advanced: bool,
    /// The update carried neither insertions nor deletions.
    pub empty: bool,
    /// Everything in the update was already integrated: no new structs, no
    /// new deletions, nothing parked waiting for missing dependencies.
    pub redundant: bool,
}

/// Encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Whether `update` is the canonical empty update, as sent by a replica that
/// has nothing the other side is missing.
pub fn is_empty_update(update: &[u8]) -> bool {
    update == EMPTY_UPDATE
}

pub struct CrdtSession {
    doc: Doc,
}

impl CrdtSession {
    /// Empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Rebuild a document from a persisted snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CrdtError> {
        let session = Self::new();
        session.apply_update(snapshot)?;
        Ok(session)
    }

    /// Encoded state vector (what this replica has seen).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Minimal update bringing a peer at `state_vector` up to date.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| CrdtError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Integrate a remote update.
    pub fn apply_update(&self, update: &[u8]) -> Result<AppliedUpdate, CrdtError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| CrdtError::InvalidUpdate(e.to_string()))?;

        let mut txn = self.doc.transact_mut();
        let before = txn.state_vector();
        let known = covered_by(&decoded, &before);
        txn.apply_update(decoded)
            .map_err(|e| CrdtError::Rejected(e.to_string()))?;
        let advanced = txn.state_vector() != before;
        let deleted = !txn.delete_set().is_empty();

        Ok(AppliedUpdate {
            delta: update.to_vec(),
            advanced,
            empty: is_empty_update(update),
            redundant: known && !advanced && !deleted,
        })
    }

    /// Full state, for persistence and late joiners with an empty vector.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Materialized content of a root text type (empty if absent).
    pub fn text(&self, root: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(root)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }
}

/// Whether every struct and deletion in `update` lies below `state`.
///
/// Anything above it is either new or pending on a struct we have not seen.
fn covered_by(update: &Update, state: &StateVector) -> bool {
    let structs = update
        .state_vector()
        .iter()
        .all(|(client, clock)| *clock <= state.get(client));
    let deletions = update
        .delete_set()
        .iter()
        .all(|(client, ranges)| ranges.iter().all(|range| range.end <= state.get(client)));
    structs && deletions
}

impl Default for CrdtSession {
    fn default() -> Self {
        Self::new()
    }
}

/// CRDT errors. None of them leave the document modified.
#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("invalid state vector: {0}")]
    InvalidStateVector(String),
    #[error("update rejected: {0}")]
    Rejected(String),
}
