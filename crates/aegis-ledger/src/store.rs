//! Ledger storage seam.
//!
//! The ledger owns the cursor and hash chain; the store only persists
//! entries keyed by sequence number. A durable backend (sqlite, postgres,
//! replicated log) slots in behind [`LedgerStore`].

use crate::entry::LedgerEntry;
use crate::LedgerError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Append-only segment store keyed by sequence number.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist an entry at its sequence number. Fails only on storage I/O.
    async fn put(&self, entry: LedgerEntry) -> Result<(), LedgerError>;

    /// Fetch a single entry.
    async fn get(&self, seq: u64) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Fetch the inclusive range `from..=to` in sequence order.
    async fn range(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Number of persisted entries.
    async fn len(&self) -> Result<u64, LedgerError>;
}

/// In-memory segment store.
pub struct InMemoryLedgerStore {
    entries: RwLock<BTreeMap<u64, LedgerEntry>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Swap a stored entry in place. Supports corruption drills and chain
    /// verification exercises; the ledger itself never calls this.
    pub fn replace(&self, seq: u64, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| LedgerError::Io("store lock poisoned".to_string()))?;
        entries.insert(seq, entry);
        Ok(())
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn put(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| LedgerError::Io("store lock poisoned".to_string()))?;
        entries.insert(entry.seq, entry);
        Ok(())
    }

    async fn get(&self, seq: u64) -> Result<Option<LedgerEntry>, LedgerError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| LedgerError::Io("store lock poisoned".to_string()))?;
        Ok(entries.get(&seq).cloned())
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>, LedgerError> {
        if to < from {
            return Err(LedgerError::InvalidRange(from, to));
        }
        let entries = self
            .entries
            .read()
            .map_err(|_| LedgerError::Io("store lock poisoned".to_string()))?;
        Ok(entries.range(from..=to).map(|(_, e)| e.clone()).collect())
    }

    async fn len(&self) -> Result<u64, LedgerError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| LedgerError::Io("store lock poisoned".to_string()))?;
        Ok(entries.len() as u64)
    }
}
