//! Ledger entry shape and the chained self-hash computation.

use crate::LedgerError;
use aegis_crypto::{hash_fields, Digest, TimestampToken};
use aegis_types::{ActorId, KeyId, Outcome, SystemMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed seed hash chained into the genesis entry.
pub const GENESIS_SEED: Digest = *b"aegis-genesis-seed-hash-v1......";

/// Decision payload recorded for every resolved action, denials included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub request_id: String,
    pub actor: ActorId,
    pub action_kind: String,
    pub resource: String,
    pub context_digest: String,
    pub outcome: Outcome,
    pub reasons: Vec<String>,
    pub escalation_required: bool,
    /// False for Deny: recorded for audit, never applied.
    pub effective: bool,
}

/// What a ledger entry records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// First-ever entry; establishes the trust root.
    Genesis {
        node_id: String,
        trusted_key_ids: Vec<KeyId>,
    },
    /// A resolved governance decision.
    Decision(DecisionRecord),
    /// Merkle root sealing the contiguous range `from_seq..=to_seq`.
    MerkleRoot {
        root: Digest,
        from_seq: u64,
        to_seq: u64,
    },
    /// Observability-driven mode change (SAFE-HALT trip, re-validation).
    ModeTransition {
        from: SystemMode,
        to: SystemMode,
        reason: String,
    },
}

impl EntryPayload {
    /// Canonical bytes fed into the self-hash. JSON with stable field order
    /// (struct order) is the canonical form across the substrate.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        serde_json::to_vec(self).map_err(|e| LedgerError::Serialization(e.to_string()))
    }
}

/// An immutable, signed, hash-chained ledger entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub prev_hash: Digest,
    pub payload: EntryPayload,
    pub self_hash: Digest,
    pub signer_key_id: KeyId,
    pub signature: Vec<u8>,
    pub wall_time: DateTime<Utc>,
    pub trusted_time: TimestampToken,
    /// Set on entries covered by a later Merkle checkpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_seq: Option<u64>,
}

impl LedgerEntry {
    /// Recompute the chained self-hash from this entry's fields.
    pub fn compute_self_hash(
        prev_hash: &Digest,
        payload: &EntryPayload,
        seq: u64,
    ) -> Result<Digest, LedgerError> {
        let payload_bytes = payload.canonical_bytes()?;
        Ok(hash_fields(&[
            prev_hash,
            &payload_bytes,
            &seq.to_le_bytes(),
        ]))
    }

    /// Bytes the ledger signer signs: the self-hash already binds the chain.
    pub fn signing_bytes(&self) -> Vec<u8> {
        self.self_hash.to_vec()
    }
}
