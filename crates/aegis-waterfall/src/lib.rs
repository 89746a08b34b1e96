//! Aegis Waterfall - the staged decision pipeline
//!
//! Every action traverses seven ordered stages: Ingress, Identity,
//! Capability, Invariant, Quorum, Commit, Egress. The three head stages are
//! the fan-out of one quorum ballot and evaluate concurrently under the
//! ballot deadline; the Quorum stage is the fan-in that resolves them. A
//! traversal ends at Egress with a Decision, or at Aborted when a stage
//! fails fatally before Commit. Strictness accumulated in the pipeline
//! context may rise across stages but never fall; a stage that would lower
//! it is rejected as a programming error.

#![deny(unsafe_code)]

use aegis_capability::CapabilityToken;
use aegis_commit::{CommitCoordinator, CommitError, CommitProposal};
use aegis_gate::{GateContext, QuorumEngine, Resolution};
use aegis_types::{
    ActionClass, ActionRequest, Decision, EntityKey, GovernanceError, HeadVerdict, Outcome,
    RequestId, Strictness, SystemMode, Verdict,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The seven pipeline stages plus the Aborted terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Ingress,
    Identity,
    Capability,
    Invariant,
    Quorum,
    Commit,
    Egress,
    Aborted,
}

/// Execution bounds for pipeline stages. The gate budget is the ballot
/// deadline every head evaluates under; the commit stage is deliberately
/// unbudgeted because a started commit must run to completion.
#[derive(Clone, Copy, Debug)]
pub struct StageBudget {
    pub gate: Duration,
}

impl Default for StageBudget {
    fn default() -> Self {
        Self {
            gate: Duration::from_millis(250),
        }
    }
}

/// State owned by one in-flight traversal and discarded on completion.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub request_id: RequestId,
    pub stage: Stage,
    strictness: Strictness,
    strictness_trace: Vec<Strictness>,
    pub verdicts: Vec<HeadVerdict>,
    pub reasons: Vec<String>,
    pub escalation_required: bool,
}

impl PipelineContext {
    fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            stage: Stage::Ingress,
            strictness: Strictness::Allow,
            strictness_trace: vec![Strictness::Allow],
            verdicts: Vec::new(),
            reasons: Vec::new(),
            escalation_required: false,
        }
    }

    fn advance(&mut self, stage: Stage) {
        tracing::trace!(request_id = %self.request_id, ?stage, "stage transition");
        self.stage = stage;
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    /// Every strictness value the traversal passed through, in order.
    pub fn strictness_trace(&self) -> &[Strictness] {
        &self.strictness_trace
    }

    /// Raise the accumulated strictness. Lowering it is a programming error
    /// and is rejected rather than silently clamped.
    pub fn raise_strictness(&mut self, strictness: Strictness) -> Result<(), GovernanceError> {
        if strictness < self.strictness {
            return Err(GovernanceError::InvariantViolation(format!(
                "stage {:?} attempted to lower strictness {:?} -> {:?}",
                self.stage, self.strictness, strictness
            )));
        }
        self.strictness = strictness;
        self.strictness_trace.push(strictness);
        Ok(())
    }
}

/// A completed traversal: the caller-facing decision plus the context it
/// accumulated, kept for evidence.
#[derive(Clone, Debug)]
pub struct Traversal {
    pub decision: Decision,
    pub context: PipelineContext,
}

#[derive(Debug, Error)]
pub enum WaterfallError {
    #[error("no ballot configured for action class {0:?}")]
    UnconfiguredClass(ActionClass),

    #[error("commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl WaterfallError {
    /// Fatal traversal errors must trip SAFE-HALT in the caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            WaterfallError::Commit(e) => e.is_fatal(),
            WaterfallError::Invariant(_) => true,
            WaterfallError::UnconfiguredClass(_) => false,
        }
    }
}

/// The pipeline engine: one ballot roster per action class, one commit
/// coordinator shared by every traversal.
pub struct Waterfall {
    ballots: HashMap<ActionClass, Arc<QuorumEngine>>,
    coordinator: Arc<CommitCoordinator>,
    /// Minimum ballot size the invariant head enforces for high-impact
    /// actions.
    high_impact_min_n: usize,
}

impl Waterfall {
    pub fn new(
        ballots: HashMap<ActionClass, Arc<QuorumEngine>>,
        coordinator: Arc<CommitCoordinator>,
        high_impact_min_n: usize,
    ) -> Self {
        Self {
            ballots,
            coordinator,
            high_impact_min_n,
        }
    }

    /// Drive one action through all seven stages. Returns the decision, or
    /// a fatal error when the traversal aborted before commit or the commit
    /// itself could not be durably recorded.
    pub async fn run(
        &self,
        request: &ActionRequest,
        mode: SystemMode,
        token: Option<CapabilityToken>,
        entity: EntityKey,
    ) -> Result<Traversal, WaterfallError> {
        let mut ctx = PipelineContext::new(request.request_id.clone());

        // Ingress: accept or reject the raw request shape.
        if let Some(reason) = malformed(request) {
            ctx.reasons.push(reason.to_string());
            ctx.raise_strictness(Strictness::Deny)
                .map_err(|e| WaterfallError::Invariant(e.to_string()))?;
            return self.commit_and_egress(request, ctx, Outcome::Deny, entity).await;
        }

        let engine = self
            .ballots
            .get(&request.class)
            .ok_or(WaterfallError::UnconfiguredClass(request.class))?;

        let gate_ctx = GateContext {
            mode,
            strictness: ctx.strictness(),
            token,
            ballot_n: engine.config().n,
            high_impact_min_n: self.high_impact_min_n,
        };

        // Identity, Capability, Invariant evaluate concurrently as the
        // ballot fan-out; the stage transitions record their verdicts in
        // canonical order as each is incorporated.
        let ballot = engine.evaluate(request, &gate_ctx).await;
        let mut incoming = ballot.verdicts.into_iter();
        for stage in [Stage::Identity, Stage::Capability, Stage::Invariant] {
            ctx.advance(stage);
            if let Some(verdict) = incoming.next() {
                ctx.verdicts.push(verdict);
            }
        }

        // Quorum: fan-in. Supplemental head verdicts (larger ballots) are
        // incorporated here, then the resolution rule runs.
        ctx.advance(Stage::Quorum);
        ctx.verdicts.extend(incoming);

        let outcome = match ballot.resolution {
            Resolution::Decided(outcome) => {
                if outcome == Outcome::Deny {
                    ctx.reasons.extend(deny_reasons(&ctx.verdicts));
                }
                outcome
            }
            Resolution::Split => {
                ctx.reasons.push("quorum_split".to_string());
                ctx.escalation_required = true;
                Outcome::Degrade
            }
        };
        ctx.raise_strictness(outcome.strictness())
            .map_err(|e| WaterfallError::Invariant(e.to_string()))?;

        self.commit_and_egress(request, ctx, outcome, entity).await
    }

    async fn commit_and_egress(
        &self,
        request: &ActionRequest,
        mut ctx: PipelineContext,
        outcome: Outcome,
        entity: EntityKey,
    ) -> Result<Traversal, WaterfallError> {
        ctx.advance(Stage::Commit);
        let committed = self
            .coordinator
            .propose(
                request,
                CommitProposal {
                    entity,
                    outcome,
                    reasons: ctx.reasons.clone(),
                    escalation_required: ctx.escalation_required,
                },
            )
            .await;

        let committed = match committed {
            Ok(committed) => committed,
            Err(e) => {
                ctx.advance(Stage::Aborted);
                tracing::error!(request_id = %ctx.request_id, error = %e, "traversal aborted");
                return Err(e.into());
            }
        };

        ctx.advance(Stage::Egress);
        Ok(Traversal {
            decision: Decision {
                request_id: request.request_id.clone(),
                outcome,
                reasons: ctx.reasons.clone(),
                ledger_seq: committed.ledger_seq,
                escalation_required: ctx.escalation_required,
            },
            context: ctx,
        })
    }
}

fn malformed(request: &ActionRequest) -> Option<&'static str> {
    if request.action_kind.is_empty() || request.resource.is_empty() {
        Some("malformed_request")
    } else if request.signature.is_empty() {
        Some("missing_signature")
    } else {
        None
    }
}

fn deny_reasons(verdicts: &[HeadVerdict]) -> Vec<String> {
    verdicts
        .iter()
        .filter(|v| v.verdict == Verdict::Deny)
        .map(|v| format!("{}:{}", v.head, v.reason))
        .collect()
}
