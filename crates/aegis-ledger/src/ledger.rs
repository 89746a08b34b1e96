//! The ledger facade: cursor ownership, chained appends, sealing, and
//! full-chain verification.

use crate::entry::{EntryPayload, LedgerEntry, GENESIS_SEED};
use crate::merkle::{merkle_path, merkle_root, verify_path, MerkleStep};
use crate::store::LedgerStore;
use crate::LedgerError;
use aegis_crypto::{Digest, KeyStore, TimestampAuthority};
use aegis_types::KeyId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Identity the ledger signs entries under.
pub const LEDGER_SIGNER: &str = "aegis-ledger";

/// Append/retry configuration.
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub node_id: String,
    /// Attempt limit for a single append before the error becomes fatal.
    pub max_append_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            node_id: "aegis-node".to_string(),
            max_append_attempts: 3,
            backoff_base: Duration::from_millis(10),
        }
    }
}

/// Cursor state: exclusively owned by the ledger, advanced by exactly one
/// per append.
struct Cursor {
    next_seq: u64,
    prev_hash: Digest,
    /// Highest sequence covered by a Merkle seal, if any.
    sealed_up_to: Option<u64>,
    /// Sequence of the most recent MerkleRoot entry, referenced by entries
    /// appended afterwards.
    last_checkpoint_seq: Option<u64>,
}

/// Inclusion proof for a sealed entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofBundle {
    pub seq: u64,
    pub self_hash: Digest,
    pub root_seq: u64,
    pub root: Digest,
    pub path: Vec<MerkleStep>,
}

impl ProofBundle {
    pub fn verify(&self) -> bool {
        verify_path(&self.self_hash, &self.path, &self.root)
    }
}

/// Append-only, hash-chained ledger.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    keystore: Arc<KeyStore>,
    tsa: Arc<TimestampAuthority>,
    config: LedgerConfig,
    cursor: Mutex<Cursor>,
}

impl Ledger {
    /// Open the ledger over a store, reconstructing the cursor from the
    /// persisted tail. An empty store starts at sequence 0 with the fixed
    /// genesis seed as the previous hash.
    pub async fn open(
        store: Arc<dyn LedgerStore>,
        keystore: Arc<KeyStore>,
        tsa: Arc<TimestampAuthority>,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        if !keystore.knows_identity(LEDGER_SIGNER) {
            keystore.generate(LEDGER_SIGNER)?;
        }

        let len = store.len().await?;
        let cursor = if len == 0 {
            Cursor {
                next_seq: 0,
                prev_hash: GENESIS_SEED,
                sealed_up_to: None,
                last_checkpoint_seq: None,
            }
        } else {
            let tail = store
                .get(len - 1)
                .await?
                .ok_or(LedgerError::NotFound(len - 1))?;
            let mut sealed_up_to = None;
            let mut last_checkpoint_seq = None;
            for entry in store.range(0, len - 1).await? {
                if let EntryPayload::MerkleRoot { to_seq, .. } = entry.payload {
                    sealed_up_to = Some(to_seq);
                    last_checkpoint_seq = Some(entry.seq);
                }
            }
            Cursor {
                next_seq: len,
                prev_hash: tail.self_hash,
                sealed_up_to,
                last_checkpoint_seq,
            }
        };

        Ok(Self {
            store,
            keystore,
            tsa,
            config,
            cursor: Mutex::new(cursor),
        })
    }

    /// Whether the ledger holds no entries yet (genesis pending).
    pub async fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.store.len().await? == 0)
    }

    /// Sequence number of the most recent entry.
    pub async fn head_seq(&self) -> Result<Option<u64>, LedgerError> {
        let len = self.store.len().await?;
        Ok(len.checked_sub(1))
    }

    /// Append a payload as the next chained entry. Atomic: on success the
    /// cursor advances by exactly one; on retry exhaustion nothing advances
    /// and the error is fatal.
    pub async fn append(&self, payload: EntryPayload) -> Result<u64, LedgerError> {
        let mut cursor = self.cursor.lock().await;
        self.append_locked(&mut cursor, payload).await
    }

    async fn append_locked(
        &self,
        cursor: &mut Cursor,
        payload: EntryPayload,
    ) -> Result<u64, LedgerError> {
        let seq = cursor.next_seq;
        if let Some(sealed_up_to) = cursor.sealed_up_to {
            // The cursor always sits past the sealed range; a violation here
            // means internal state corruption, not a caller mistake.
            if seq <= sealed_up_to {
                return Err(LedgerError::SealedRange { seq, sealed_up_to });
            }
        }

        let self_hash = LedgerEntry::compute_self_hash(&cursor.prev_hash, &payload, seq)?;
        let (signer_key_id, signature) = self.keystore.sign(LEDGER_SIGNER, &self_hash)?;
        let trusted_time = self.tsa.timestamp(self_hash)?;

        let entry = LedgerEntry {
            seq,
            prev_hash: cursor.prev_hash,
            payload,
            self_hash,
            signer_key_id,
            signature,
            wall_time: Utc::now(),
            trusted_time,
            checkpoint_seq: cursor.last_checkpoint_seq,
        };

        let mut last_error = String::new();
        for attempt in 0..self.config.max_append_attempts {
            match self.store.put(entry.clone()).await {
                Ok(()) => {
                    cursor.next_seq = seq + 1;
                    cursor.prev_hash = self_hash;
                    tracing::debug!(seq, "ledger append committed");
                    return Ok(seq);
                }
                Err(LedgerError::Io(msg)) => {
                    last_error = msg;
                    let delay = self.config.backoff_base * 2u32.saturating_pow(attempt);
                    tracing::warn!(seq, attempt, delay_ms = delay.as_millis() as u64,
                        "ledger append I/O failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }

        tracing::error!(seq, "ledger append retries exhausted");
        Err(LedgerError::RetriesExhausted {
            attempts: self.config.max_append_attempts,
            last: last_error,
        })
    }

    /// Read the inclusive range `from..=to`.
    pub async fn read(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.range(from, to).await
    }

    /// Recompute every self-hash and chain link from sequence 0 (or the
    /// given checkpoint) through the head. Any mismatch is corruption.
    pub async fn verify_chain(&self, from_checkpoint: Option<u64>) -> Result<(), LedgerError> {
        let len = self.store.len().await?;
        if len == 0 {
            return Ok(());
        }
        let start = from_checkpoint.unwrap_or(0);
        let entries = self.store.range(start, len - 1).await?;

        let mut expected_prev = if start == 0 {
            GENESIS_SEED
        } else {
            match self.store.get(start - 1).await? {
                Some(prior) => prior.self_hash,
                None => return Err(LedgerError::Corruption(start)),
            }
        };
        let mut expected_seq = start;

        for entry in &entries {
            if entry.seq != expected_seq || entry.prev_hash != expected_prev {
                return Err(LedgerError::Corruption(entry.seq));
            }
            let recomputed =
                LedgerEntry::compute_self_hash(&entry.prev_hash, &entry.payload, entry.seq)?;
            if recomputed != entry.self_hash {
                return Err(LedgerError::Corruption(entry.seq));
            }
            // verify() rejects unknown key ids, so a rewritten suffix under
            // a fabricated signer fails closed here as well.
            if !self
                .keystore
                .verify(&entry.signer_key_id, &entry.self_hash, &entry.signature)
            {
                return Err(LedgerError::Corruption(entry.seq));
            }
            if let EntryPayload::MerkleRoot { root, from_seq, to_seq } = &entry.payload {
                let sealed = self.store.range(*from_seq, *to_seq).await?;
                let leaves: Vec<Digest> = sealed.iter().map(|e| e.self_hash).collect();
                if merkle_root(&leaves) != Some(*root) {
                    return Err(LedgerError::Corruption(entry.seq));
                }
            }
            expected_prev = entry.self_hash;
            expected_seq = entry.seq + 1;
        }
        Ok(())
    }

    /// Seal the unsealed prefix up to `up_to` into a Merkle root entry.
    /// Sealed ranges are immutable; re-sealing is rejected outright.
    pub async fn seal(&self, up_to: u64) -> Result<Digest, LedgerError> {
        let mut cursor = self.cursor.lock().await;

        if up_to >= cursor.next_seq {
            return Err(LedgerError::InvalidRange(up_to, cursor.next_seq));
        }
        let from_seq = match cursor.sealed_up_to {
            Some(sealed_up_to) => {
                if up_to <= sealed_up_to {
                    return Err(LedgerError::SealedRange {
                        seq: up_to,
                        sealed_up_to,
                    });
                }
                sealed_up_to + 1
            }
            None => 0,
        };

        let entries = self.store.range(from_seq, up_to).await?;
        let leaves: Vec<Digest> = entries.iter().map(|e| e.self_hash).collect();
        let root = merkle_root(&leaves).ok_or(LedgerError::InvalidRange(from_seq, up_to))?;

        let root_seq = self
            .append_locked(
                &mut cursor,
                EntryPayload::MerkleRoot {
                    root,
                    from_seq,
                    to_seq: up_to,
                },
            )
            .await?;

        cursor.sealed_up_to = Some(up_to);
        cursor.last_checkpoint_seq = Some(root_seq);
        tracing::info!(
            from_seq,
            to_seq = up_to,
            root_seq,
            root = %aegis_crypto::hex_digest(&root),
            "sealed ledger range"
        );
        Ok(root)
    }

    /// Inclusion proof for a sealed entry; None while the entry is unsealed.
    pub async fn proof_bundle(&self, seq: u64) -> Result<Option<ProofBundle>, LedgerError> {
        let len = self.store.len().await?;
        if len == 0 {
            return Ok(None);
        }
        let entry = self.store.get(seq).await?.ok_or(LedgerError::NotFound(seq))?;

        if seq + 1 > len - 1 {
            return Ok(None);
        }
        for candidate in self.store.range(seq + 1, len - 1).await? {
            if let EntryPayload::MerkleRoot { root, from_seq, to_seq } = candidate.payload {
                if from_seq <= seq && seq <= to_seq {
                    let sealed = self.store.range(from_seq, to_seq).await?;
                    let leaves: Vec<Digest> = sealed.iter().map(|e| e.self_hash).collect();
                    let index = (seq - from_seq) as usize;
                    let path = merkle_path(&leaves, index)
                        .ok_or(LedgerError::InvalidRange(from_seq, to_seq))?;
                    return Ok(Some(ProofBundle {
                        seq,
                        self_hash: entry.self_hash,
                        root_seq: candidate.seq,
                        root,
                        path,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Key id currently signing ledger entries.
    pub fn signer_key(&self) -> Result<KeyId, LedgerError> {
        Ok(self.keystore.active_key(LEDGER_SIGNER)?)
    }
}
