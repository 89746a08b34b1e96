//! The external boundary: every operation an outside collaborator may call.

use crate::bootstrap::{BootstrapError, GenesisCoordinator, ReadinessGate, SafeHaltController};
use crate::detector::{DetectorConfig, FailureDetector};
use aegis_capability::{CapabilityAuthority, CapabilityError, CapabilityToken};
use aegis_commit::{CommitCoordinator, CommitError, CommitProposal};
use aegis_crypto::{CryptoError, KeyStore, TimestampAuthority};
use aegis_gate::{
    CapabilityHead, CompositeHead, GateHead, IdentityHead, InvariantHead, QuorumConfig,
    QuorumEngine, QuorumError,
};
use aegis_ledger::{Ledger, LedgerConfig, LedgerEntry, LedgerError, LedgerStore};
use aegis_types::{
    ActionClass, ActionRequest, ActorId, Decision, EntityKey, GovernanceError, Outcome, Scope,
    SystemMode,
};
use aegis_waterfall::{StageBudget, Waterfall, WaterfallError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const ISSUE_CAPABILITY_KIND: &str = "issue_capability";
pub const REVOKE_CAPABILITY_KIND: &str = "revoke_capability";

/// Everything needed to bring a node up.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub node_id: String,
    pub stage_budget: StageBudget,
    /// Ballot size the invariant head requires for high-impact actions.
    pub high_impact_min_n: usize,
    pub detector: DetectorConfig,
    pub ledger: LedgerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            node_id: "aegis-node".to_string(),
            stage_budget: StageBudget::default(),
            high_impact_min_n: 7,
            detector: DetectorConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

/// Construction-time failures, before the service accepts any traffic.
#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    #[error("capability authority failure: {0}")]
    Capability(#[from] CapabilityError),

    #[error("ballot configuration invalid: {0}")]
    Quorum(#[from] QuorumError),

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Deserialize)]
struct IssueParams {
    subject: String,
    scope: Scope,
    ttl_seconds: i64,
}

#[derive(Debug, Deserialize)]
struct RevokeParams {
    subject: String,
    scope: Scope,
}

/// The governance substrate, fully wired. All components are constructed
/// here and injected; nothing reaches for globals.
pub struct AegisService {
    keystore: Arc<KeyStore>,
    authority: Arc<CapabilityAuthority>,
    ledger: Arc<Ledger>,
    coordinator: Arc<CommitCoordinator>,
    waterfall: Waterfall,
    genesis: GenesisCoordinator,
    readiness: ReadinessGate,
    halt: SafeHaltController,
    detector: FailureDetector,
}

impl AegisService {
    /// Boot a node over the given store: build the trust root, write or
    /// verify the chain, and open the readiness gate.
    pub async fn boot(
        store: Arc<dyn LedgerStore>,
        config: ServiceConfig,
    ) -> Result<Self, BootError> {
        let keystore = Arc::new(KeyStore::new());
        let tsa = Arc::new(TimestampAuthority::new(Arc::clone(&keystore))?);
        let ledger = Arc::new(
            Ledger::open(
                store,
                Arc::clone(&keystore),
                tsa,
                config.ledger.clone(),
            )
            .await?,
        );
        let authority = Arc::new(CapabilityAuthority::new(Arc::clone(&keystore))?);
        let coordinator = Arc::new(CommitCoordinator::new(Arc::clone(&ledger)));

        let base_heads = || -> Vec<Arc<dyn GateHead>> {
            vec![
                Arc::new(IdentityHead::new(Arc::clone(&keystore))),
                Arc::new(CapabilityHead::new(Arc::clone(&authority))),
                Arc::new(InvariantHead::new()),
            ]
        };

        let standard = QuorumConfig::standard(config.stage_budget.gate);
        let high_impact = QuorumConfig::high_impact(config.stage_budget.gate);

        // High-impact ballots replicate the full gate: each participant
        // evaluates every concern, so a single concern's denial can reach
        // the deny threshold instead of being outvoted.
        let replicas: Vec<Arc<dyn GateHead>> = (0..high_impact.n)
            .map(|i| {
                Arc::new(CompositeHead::new(format!("gate-{i}"), base_heads()))
                    as Arc<dyn GateHead>
            })
            .collect();

        let mut ballots = HashMap::new();
        ballots.insert(
            ActionClass::Standard,
            Arc::new(QuorumEngine::new(base_heads(), standard)?),
        );
        ballots.insert(
            ActionClass::HighImpact,
            Arc::new(QuorumEngine::new(replicas, high_impact)?),
        );

        let waterfall = Waterfall::new(
            ballots,
            Arc::clone(&coordinator),
            config.high_impact_min_n,
        );

        let genesis =
            GenesisCoordinator::new(Arc::clone(&ledger), Arc::clone(&keystore), config.node_id);
        let readiness = ReadinessGate::new();
        readiness.validate(&genesis).await?;
        let halt = SafeHaltController::new(Arc::clone(&ledger));

        Ok(Self {
            keystore,
            authority,
            ledger,
            coordinator,
            waterfall,
            genesis,
            readiness,
            halt,
            detector: FailureDetector::new(config.detector),
        })
    }

    /// Trust-root surface for operators: actor key enrollment and rotation.
    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    /// Direct authority handle for operator bootstrap; routine issuance and
    /// revocation go through the pipeline-gated operations below.
    pub fn capability_authority(&self) -> &Arc<CapabilityAuthority> {
        &self.authority
    }

    /// Drive one action through the full pipeline.
    pub async fn submit_action(
        &self,
        request: ActionRequest,
        token: Option<CapabilityToken>,
    ) -> Result<Decision, GovernanceError> {
        let mode = self.halt.mode();
        if mode == SystemMode::Halted || !self.readiness.is_ready() {
            return Err(GovernanceError::SystemHalted);
        }

        if self.detector.dampened(&request.actor, &request.action_kind) {
            return self.reject_dampened(&request).await;
        }

        let entity = EntityKey::new(request.resource.clone());
        match self.waterfall.run(&request, mode, token, entity).await {
            Ok(traversal) => {
                let decision = traversal.decision;
                self.detector.record(
                    &request.actor,
                    &request.action_kind,
                    decision.outcome == Outcome::Deny,
                );
                if decision.escalation_required {
                    self.halt.degrade("unresolved ballot requires escalation").await;
                }
                Ok(decision)
            }
            Err(e) => {
                let mapped = map_waterfall_error(&e);
                if e.is_fatal() {
                    self.halt.trip(&e.to_string()).await;
                }
                Err(mapped)
            }
        }
    }

    /// Pipeline-gated issuance: the request itself must carry the kind
    /// `issue_capability` and an authorizing token; the new token's
    /// parameters ride in the request context.
    pub async fn issue_capability(
        &self,
        request: ActionRequest,
        authorizing: Option<CapabilityToken>,
    ) -> Result<(Decision, Option<CapabilityToken>), GovernanceError> {
        if request.action_kind != ISSUE_CAPABILITY_KIND {
            return Err(GovernanceError::InvariantViolation(format!(
                "issuance requires action kind {ISSUE_CAPABILITY_KIND}"
            )));
        }
        let params: IssueParams = serde_json::from_value(request.context.clone())
            .map_err(|e| GovernanceError::InvariantViolation(format!("bad issue params: {e}")))?;

        let decision = self.submit_action(request, authorizing).await?;
        if !decision.outcome.is_effective() {
            return Ok((decision, None));
        }
        let token = self
            .authority
            .issue(
                ActorId::new(params.subject),
                params.scope,
                chrono::Duration::seconds(params.ttl_seconds),
            )
            .map_err(internal_error)?;
        Ok((decision, Some(token)))
    }

    /// Pipeline-gated revocation, same pattern as issuance.
    pub async fn revoke_capability(
        &self,
        request: ActionRequest,
        authorizing: Option<CapabilityToken>,
    ) -> Result<Decision, GovernanceError> {
        if request.action_kind != REVOKE_CAPABILITY_KIND {
            return Err(GovernanceError::InvariantViolation(format!(
                "revocation requires action kind {REVOKE_CAPABILITY_KIND}"
            )));
        }
        let params: RevokeParams = serde_json::from_value(request.context.clone())
            .map_err(|e| GovernanceError::InvariantViolation(format!("bad revoke params: {e}")))?;

        let decision = self.submit_action(request, authorizing).await?;
        if decision.outcome.is_effective() {
            self.authority
                .revoke(ActorId::new(params.subject), params.scope)
                .map_err(internal_error)?;
        }
        Ok(decision)
    }

    /// Read-only ledger access. Deliberately available while Halted: audit
    /// must survive the faults it exists to explain.
    pub async fn query_ledger(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<LedgerEntry>, GovernanceError> {
        self.ledger.read(from, to).await.map_err(map_ledger_error)
    }

    pub fn get_system_mode(&self) -> SystemMode {
        self.halt.mode()
    }

    /// Re-verify the whole chain; corruption trips SAFE-HALT.
    pub async fn audit(&self) -> Result<(), GovernanceError> {
        match self.ledger.verify_chain(None).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mapped = map_ledger_error(e);
                self.halt.trip(&mapped.to_string()).await;
                Err(mapped)
            }
        }
    }

    /// Operator-driven re-validation: the only path out of Halted. Runs the
    /// same genesis/verification sequence as boot.
    pub async fn revalidate(&self) -> Result<SystemMode, GovernanceError> {
        match self.readiness.validate(&self.genesis).await {
            Ok(()) => {
                self.halt.restore("readiness re-validation succeeded").await;
                Ok(self.halt.mode())
            }
            Err(e) => {
                tracing::error!(error = %e, "re-validation failed; staying halted");
                Err(match e {
                    BootstrapError::Ledger(le) => map_ledger_error(le),
                    BootstrapError::Crypto(ce) => internal_error(ce),
                })
            }
        }
    }

    /// Seal the ledger prefix up to `up_to` into a Merkle checkpoint.
    pub async fn seal_ledger(&self, up_to: u64) -> Result<(), GovernanceError> {
        self.ledger.seal(up_to).await.map(|_| ()).map_err(map_ledger_error)
    }

    async fn reject_dampened(&self, request: &ActionRequest) -> Result<Decision, GovernanceError> {
        tracing::warn!(actor = %request.actor, kind = %request.action_kind,
            "submission dampened before the gate plane");
        let committed = self
            .coordinator
            .propose(
                request,
                CommitProposal {
                    entity: EntityKey::new(request.resource.clone()),
                    outcome: Outcome::Deny,
                    reasons: vec!["submission_dampened".to_string()],
                    escalation_required: false,
                },
            )
            .await;
        match committed {
            Ok(committed) => Ok(Decision {
                request_id: request.request_id.clone(),
                outcome: Outcome::Deny,
                reasons: vec!["submission_dampened".to_string()],
                ledger_seq: committed.ledger_seq,
                escalation_required: false,
            }),
            Err(e) => {
                let mapped = map_commit_error(&e);
                if e.is_fatal() {
                    self.halt.trip(&e.to_string()).await;
                }
                Err(mapped)
            }
        }
    }
}

fn map_waterfall_error(e: &WaterfallError) -> GovernanceError {
    match e {
        WaterfallError::Commit(ce) => map_commit_error(ce),
        WaterfallError::Invariant(msg) => GovernanceError::InvariantViolation(msg.clone()),
        WaterfallError::UnconfiguredClass(class) => {
            GovernanceError::InvariantViolation(format!("no ballot for class {class:?}"))
        }
    }
}

fn map_commit_error(e: &CommitError) -> GovernanceError {
    match e {
        CommitError::Ledger(LedgerError::Corruption(seq)) => {
            GovernanceError::LedgerCorruption(*seq)
        }
        CommitError::Ledger(LedgerError::RetriesExhausted { attempts, last }) => {
            GovernanceError::StorageIOFailure(format!(
                "append failed after {attempts} attempts: {last}"
            ))
        }
        CommitError::Ledger(other) => GovernanceError::LedgerWriteConflict(other.to_string()),
        CommitError::LockError | CommitError::AppendInterrupted => {
            GovernanceError::LedgerWriteConflict(e.to_string())
        }
    }
}

fn map_ledger_error(e: LedgerError) -> GovernanceError {
    match e {
        LedgerError::Corruption(seq) => GovernanceError::LedgerCorruption(seq),
        LedgerError::Io(msg) => GovernanceError::StorageIOFailure(msg),
        LedgerError::RetriesExhausted { attempts, last } => GovernanceError::StorageIOFailure(
            format!("append failed after {attempts} attempts: {last}"),
        ),
        other => GovernanceError::LedgerWriteConflict(other.to_string()),
    }
}

fn internal_error(e: impl std::fmt::Display) -> GovernanceError {
    GovernanceError::StorageIOFailure(e.to_string())
}
