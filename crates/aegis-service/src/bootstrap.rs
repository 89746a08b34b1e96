//! Startup integrity: genesis, readiness, and the SAFE-HALT controller.

use aegis_crypto::{CryptoError, KeyStore};
use aegis_ledger::{EntryPayload, Ledger, LedgerError};
use aegis_types::SystemMode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// Writes the genesis entry on a fresh ledger; verifies the chain on every
/// subsequent startup before any traffic is admitted.
pub struct GenesisCoordinator {
    ledger: Arc<Ledger>,
    keystore: Arc<KeyStore>,
    node_id: String,
}

impl GenesisCoordinator {
    pub fn new(ledger: Arc<Ledger>, keystore: Arc<KeyStore>, node_id: impl Into<String>) -> Self {
        Self {
            ledger,
            keystore,
            node_id: node_id.into(),
        }
    }

    /// Establish or re-verify the trust root. Idempotent across restarts.
    pub async fn establish(&self) -> Result<(), BootstrapError> {
        if self.ledger.is_empty().await? {
            let trusted_key_ids = self
                .keystore
                .trusted_keys()?
                .into_iter()
                .map(|info| info.key_id)
                .collect();
            let seq = self
                .ledger
                .append(EntryPayload::Genesis {
                    node_id: self.node_id.clone(),
                    trusted_key_ids,
                })
                .await?;
            tracing::info!(seq, node_id = %self.node_id, "genesis entry written");
        } else {
            self.ledger.verify_chain(None).await?;
            tracing::info!(node_id = %self.node_id, "existing chain verified");
        }
        Ok(())
    }
}

/// Gates traffic until genesis and full-chain verification have succeeded.
pub struct ReadinessGate {
    ready: AtomicBool,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Run the genesis coordinator and open the gate on success.
    pub async fn validate(&self, genesis: &GenesisCoordinator) -> Result<(), BootstrapError> {
        self.ready.store(false, Ordering::SeqCst);
        genesis.establish().await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One-way protective mode switch. Trips on fatal faults; only an explicit
/// readiness re-validation clears it.
pub struct SafeHaltController {
    mode: RwLock<SystemMode>,
    ledger: Arc<Ledger>,
}

impl SafeHaltController {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            mode: RwLock::new(SystemMode::Normal),
            ledger,
        }
    }

    /// Current mode. A poisoned lock reads as Halted: fail closed.
    pub fn mode(&self) -> SystemMode {
        self.mode
            .read()
            .map(|m| *m)
            .unwrap_or(SystemMode::Halted)
    }

    /// Trip to Halted. The transition is recorded in the ledger; if even
    /// that append fails the mode still flips, because halting must never
    /// depend on the component whose failure caused it.
    pub async fn trip(&self, reason: &str) {
        let from = match self.switch(SystemMode::Halted) {
            Some(from) => from,
            None => return,
        };
        tracing::error!(%reason, ?from, "SAFE-HALT tripped");
        self.record_transition(from, SystemMode::Halted, reason).await;
    }

    /// Lower Normal to Degraded. No-op in any other mode.
    pub async fn degrade(&self, reason: &str) {
        {
            let Ok(mut mode) = self.mode.write() else { return };
            if *mode != SystemMode::Normal {
                return;
            }
            *mode = SystemMode::Degraded;
        }
        tracing::warn!(%reason, "system degraded");
        self.record_transition(SystemMode::Normal, SystemMode::Degraded, reason)
            .await;
    }

    /// Restore Normal after a successful re-validation.
    pub(crate) async fn restore(&self, reason: &str) {
        let from = match self.switch(SystemMode::Normal) {
            Some(from) => from,
            None => return,
        };
        tracing::info!(%reason, ?from, "system restored to normal");
        self.record_transition(from, SystemMode::Normal, reason).await;
    }

    fn switch(&self, to: SystemMode) -> Option<SystemMode> {
        let mut mode = self.mode.write().ok()?;
        if *mode == to {
            return None;
        }
        let from = *mode;
        *mode = to;
        Some(from)
    }

    async fn record_transition(&self, from: SystemMode, to: SystemMode, reason: &str) {
        let result = self
            .ledger
            .append(EntryPayload::ModeTransition {
                from,
                to,
                reason: reason.to_string(),
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to record mode transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_crypto::TimestampAuthority;
    use aegis_ledger::{InMemoryLedgerStore, LedgerConfig, LedgerStore};

    async fn ledger_fixture() -> (Arc<Ledger>, Arc<KeyStore>, Arc<InMemoryLedgerStore>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let keystore = Arc::new(KeyStore::new());
        let tsa = Arc::new(TimestampAuthority::new(Arc::clone(&keystore)).unwrap());
        let ledger = Arc::new(
            Ledger::open(
                Arc::clone(&store) as Arc<dyn LedgerStore>,
                Arc::clone(&keystore),
                tsa,
                LedgerConfig::default(),
            )
            .await
            .unwrap(),
        );
        (ledger, keystore, store)
    }

    #[tokio::test]
    async fn genesis_is_written_once_and_verified_after() {
        let (ledger, keystore, store) = ledger_fixture().await;
        let genesis = GenesisCoordinator::new(Arc::clone(&ledger), keystore, "node-1");

        genesis.establish().await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        let entry = store.get(0).await.unwrap().unwrap();
        assert!(matches!(entry.payload, EntryPayload::Genesis { .. }));

        // Second startup verifies instead of rewriting.
        genesis.establish().await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn readiness_opens_only_after_validation() {
        let (ledger, keystore, _) = ledger_fixture().await;
        let genesis = GenesisCoordinator::new(Arc::clone(&ledger), keystore, "node-1");
        let gate = ReadinessGate::new();

        assert!(!gate.is_ready());
        gate.validate(&genesis).await.unwrap();
        assert!(gate.is_ready());
    }

    #[tokio::test]
    async fn halt_is_one_way_and_recorded() {
        let (ledger, _, store) = ledger_fixture().await;
        let halt = SafeHaltController::new(Arc::clone(&ledger));

        assert_eq!(halt.mode(), SystemMode::Normal);
        halt.trip("chain mismatch at sequence 3").await;
        assert_eq!(halt.mode(), SystemMode::Halted);

        // Degrade cannot move a halted system.
        halt.degrade("late degrade").await;
        assert_eq!(halt.mode(), SystemMode::Halted);

        let entry = store.get(0).await.unwrap().unwrap();
        match entry.payload {
            EntryPayload::ModeTransition { from, to, .. } => {
                assert_eq!(from, SystemMode::Normal);
                assert_eq!(to, SystemMode::Halted);
            }
            other => panic!("expected a mode transition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn restore_clears_halted() {
        let (ledger, _, _) = ledger_fixture().await;
        let halt = SafeHaltController::new(ledger);
        halt.trip("fault").await;
        halt.restore("revalidated").await;
        assert_eq!(halt.mode(), SystemMode::Normal);
    }
}
