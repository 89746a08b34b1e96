//! Aegis Commit - the commit coordinator
//!
//! Every resolved decision funnels through here on its way into the ledger.
//! Proposals targeting the same entity key serialize FIFO behind a per-key
//! lock; proposals on different keys proceed independently. A Deny is
//! appended for audit but never applied. Once a proposal holds its lock and
//! the append has started, the operation runs to completion even if the
//! caller goes away: an action whose record may or may not have landed is
//! worse than either certainty.

#![deny(unsafe_code)]

use aegis_ledger::{DecisionRecord, EntryPayload, Ledger, LedgerError};
use aegis_types::{ActionRequest, EntityKey, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;

/// A decision ready to be committed: the resolved outcome plus its evidence.
#[derive(Clone, Debug)]
pub struct CommitProposal {
    pub entity: EntityKey,
    pub outcome: Outcome,
    pub reasons: Vec<String>,
    pub escalation_required: bool,
}

/// What the coordinator durably recorded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitResult {
    pub ledger_seq: u64,
    pub outcome: Outcome,
    /// False when the record is audit-only (Deny).
    pub applied: bool,
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    #[error("lock table poisoned")]
    LockError,

    #[error("append task aborted before completion")]
    AppendInterrupted,
}

impl CommitError {
    pub fn is_fatal(&self) -> bool {
        match self {
            CommitError::Ledger(e) => e.is_fatal(),
            CommitError::LockError => true,
            CommitError::AppendInterrupted => true,
        }
    }
}

/// Serializes decision commits per entity key and appends them to the ledger.
pub struct CommitCoordinator {
    ledger: Arc<Ledger>,
    locks: StdMutex<HashMap<EntityKey, Arc<Mutex<()>>>>,
}

impl CommitCoordinator {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn entity_lock(&self, entity: &EntityKey) -> Result<Arc<Mutex<()>>, CommitError> {
        let mut locks = self.locks.lock().map_err(|_| CommitError::LockError)?;
        Ok(Arc::clone(
            locks
                .entry(entity.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    /// Commit one resolved decision. Waits FIFO behind earlier proposals on
    /// the same entity; the ledger append runs on a detached task that
    /// carries the entity lock with it, so cancelling the caller can neither
    /// interrupt the append nor release the lock mid-flight.
    pub async fn propose(
        &self,
        request: &ActionRequest,
        proposal: CommitProposal,
    ) -> Result<CommitResult, CommitError> {
        let lock = self.entity_lock(&proposal.entity)?;
        let guard = lock.lock_owned().await;

        let record = DecisionRecord {
            request_id: request.request_id.0.clone(),
            actor: request.actor.clone(),
            action_kind: request.action_kind.clone(),
            resource: request.resource.clone(),
            context_digest: request.context_digest(),
            outcome: proposal.outcome,
            reasons: proposal.reasons,
            escalation_required: proposal.escalation_required,
            effective: proposal.outcome.is_effective(),
        };
        let applied = record.effective;

        let ledger = Arc::clone(&self.ledger);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            ledger.append(EntryPayload::Decision(record)).await
        });
        let ledger_seq = handle
            .await
            .map_err(|_| CommitError::AppendInterrupted)??;

        tracing::debug!(
            ledger_seq,
            entity = %proposal.entity,
            outcome = ?proposal.outcome,
            applied,
            "decision committed"
        );
        Ok(CommitResult {
            ledger_seq,
            outcome: proposal.outcome,
            applied,
        })
    }
}
