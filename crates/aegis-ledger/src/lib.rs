//! Aegis Ledger - the durable memory of the governance substrate
//!
//! Every resolved decision, mode transition, and Merkle checkpoint lands here
//! as an append-only, hash-chained, individually signed entry. Entries are
//! created only by the commit path, never mutated after append, and
//! periodically sealed into Merkle roots that are themselves ledger entries.
//!
//! An action whose outcome cannot be durably recorded must not be considered
//! decided: append retries a bounded number of times and then reports a fatal
//! error that the service escalates to SAFE-HALT.

#![deny(unsafe_code)]

pub mod entry;
pub mod ledger;
pub mod merkle;
pub mod store;

pub use entry::{DecisionRecord, EntryPayload, LedgerEntry, GENESIS_SEED};
pub use ledger::{Ledger, LedgerConfig, ProofBundle};
pub use merkle::{merkle_path, merkle_root, verify_path, MerkleStep};
pub use store::{InMemoryLedgerStore, LedgerStore};

use thiserror::Error;

/// Ledger-plane errors. `Corruption` and `RetriesExhausted` are the two
/// fatal kinds; everything else resolves locally.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("entry {0} not found")]
    NotFound(u64),

    #[error("invalid range: {0}..={1}")]
    InvalidRange(u64, u64),

    #[error("sequence {seq} lies in the sealed range (sealed up to {sealed_up_to})")]
    SealedRange { seq: u64, sealed_up_to: u64 },

    #[error("chain mismatch at sequence {0}")]
    Corruption(u64),

    #[error("storage I/O failure: {0}")]
    Io(String),

    #[error("append failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("crypto failure: {0}")]
    Crypto(#[from] aegis_crypto::CryptoError),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl LedgerError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::Corruption(_) | LedgerError::RetriesExhausted { .. }
        )
    }
}
