//! Two-phase state-vector sync on top of the yrs CRDT engine.
//!
//! ```text
//! server                          client
//!   │── Step1(sv_server) ──────────►│
//!   │◄────────────── Step1(sv_client)│
//!   │── Step2(diff(sv_client)) ────►│
//!   │◄──────────── Step2(diff(sv_s)) │
//!   │◄═══════════ Update(delta) ════►│   steady state
//! ```
//!
//! Only the operations the peer is missing travel over the wire.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::protocol::{Message, ProtocolError, SyncMessage};

/// v1 encoding of an update that carries no structs and no deletions.
pub const EMPTY_UPDATE_V1: &[u8] = &[0, 0];

/// Result of handling one inbound sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Send this frame back to the originating peer only.
    Reply(Message),
    /// An update was merged; `Some` holds the delta it produced locally,
    /// which must be relayed to every other peer.
    Applied(Option<Vec<u8>>),
}

/// Encode the document's state vector.
pub fn state_vector(doc: &Doc) -> Vec<u8> {
    doc.transact().state_vector().encode_v1()
}

/// Build the step 1 frame a newly joined peer receives.
pub fn step1(doc: &Doc) -> Message {
    Message::Sync(SyncMessage::Step1(state_vector(doc)))
}

/// Everything in `doc` that a replica at `remote_sv` is missing.
pub fn encode_diff(doc: &Doc, remote_sv: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let sv = StateVector::decode_v1(remote_sv)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    Ok(doc.transact().encode_diff_v1(&sv))
}

/// Full document state as a single update.
pub fn full_state(doc: &Doc) -> Vec<u8> {
    doc.transact()
        .encode_state_as_update_v1(&StateVector::default())
}

/// Merge an update into `doc`.
///
/// Returns the update the merge transaction produced, or `None` when the
/// blob added nothing new (already known, or parked as pending).
pub fn apply_update(doc: &Doc, update: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
    let update =
        Update::decode_v1(update).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| ProtocolError::Merge(e.to_string()))?;
    let produced = txn.encode_update_v1();
    drop(txn);

    if produced.as_slice() == EMPTY_UPDATE_V1 {
        Ok(None)
    } else {
        Ok(Some(produced))
    }
}

/// Dispatch one sync message against `doc`.
pub fn handle_sync_message(doc: &Doc, msg: &SyncMessage) -> Result<SyncOutcome, ProtocolError> {
    match msg {
        SyncMessage::Step1(sv) => {
            let diff = encode_diff(doc, sv)?;
            Ok(SyncOutcome::Reply(Message::Sync(SyncMessage::Step2(diff))))
        }
        SyncMessage::Step2(update) | SyncMessage::Update(update) => {
            apply_update(doc, update).map(SyncOutcome::Applied)
        }
    }
}
