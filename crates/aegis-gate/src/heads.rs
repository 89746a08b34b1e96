//! The three verdict heads.
//!
//! Heads never return errors: every failure mode is folded into a verdict
//! with evidence, and the quorum engine resolves the collection.

use aegis_capability::{CapabilityAuthority, CapabilityToken};
use aegis_crypto::KeyStore;
use aegis_types::{
    ActionClass, ActionRequest, GovernanceError, HeadVerdict, Strictness, SystemMode, Verdict,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Per-traversal inputs shared by all heads.
#[derive(Clone, Debug)]
pub struct GateContext {
    pub mode: SystemMode,
    /// Strictness accumulated by earlier stages of this traversal.
    pub strictness: Strictness,
    /// Capability token presented with the request, if any.
    pub token: Option<CapabilityToken>,
    /// Number of participants in the ballot this evaluation feeds.
    pub ballot_n: usize,
    /// Minimum ballot size required for high-impact actions.
    pub high_impact_min_n: usize,
}

/// A single independent evaluator of one action.
#[async_trait]
pub trait GateHead: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, request: &ActionRequest, ctx: &GateContext) -> HeadVerdict;
}

/// Verifies the actor's signature over the action request.
pub struct IdentityHead {
    keystore: Arc<KeyStore>,
}

impl IdentityHead {
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self { keystore }
    }
}

#[async_trait]
impl GateHead for IdentityHead {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn evaluate(&self, request: &ActionRequest, _ctx: &GateContext) -> HeadVerdict {
        if !self.keystore.knows_identity(&request.actor.0) {
            return HeadVerdict::new(self.name(), Verdict::Deny, "actor_unknown");
        }
        let payload = request.signing_bytes();
        let verified = self
            .keystore
            .trusted_keys()
            .unwrap_or_default()
            .iter()
            .filter(|info| info.identity == request.actor.0)
            .any(|info| {
                self.keystore
                    .verify(&info.key_id, &payload, &request.signature)
            });
        if verified {
            HeadVerdict::new(self.name(), Verdict::Allow, "actor_signature_valid")
        } else {
            HeadVerdict::new(self.name(), Verdict::Deny, "actor_signature_invalid")
        }
    }
}

/// Delegates to the capability authority and carries its specific denial
/// reason into the verdict evidence.
pub struct CapabilityHead {
    authority: Arc<CapabilityAuthority>,
}

impl CapabilityHead {
    pub fn new(authority: Arc<CapabilityAuthority>) -> Self {
        Self { authority }
    }

    fn denial_reason(denial: &GovernanceError) -> &'static str {
        match denial {
            GovernanceError::BadSignature => "capability_bad_signature",
            GovernanceError::ExpiredCapability => "capability_expired",
            GovernanceError::ScopeMismatch => "capability_scope_mismatch",
            GovernanceError::CapabilityRevoked => "capability_revoked",
            _ => "capability_denied",
        }
    }
}

#[async_trait]
impl GateHead for CapabilityHead {
    fn name(&self) -> &'static str {
        "capability"
    }

    async fn evaluate(&self, request: &ActionRequest, ctx: &GateContext) -> HeadVerdict {
        let Some(token) = ctx.token.as_ref() else {
            return HeadVerdict::new(self.name(), Verdict::Deny, "capability_missing");
        };
        if token.subject != request.actor {
            return HeadVerdict::new(self.name(), Verdict::Deny, "capability_subject_mismatch");
        }
        match self
            .authority
            .verify(token, &request.action_kind, &request.resource, Utc::now())
        {
            Ok(check) if check.authorized => {
                HeadVerdict::new(self.name(), Verdict::Allow, "capability_ok")
            }
            Ok(check) => {
                let reason = check
                    .denial
                    .as_ref()
                    .map(Self::denial_reason)
                    .unwrap_or("capability_denied");
                HeadVerdict::new(self.name(), Verdict::Deny, reason)
            }
            // Infrastructure failure: the head cannot evaluate, so it
            // abstains rather than defaulting either way.
            Err(_) => HeadVerdict::new(self.name(), Verdict::Abstain, "capability_unavailable"),
        }
    }
}

/// Evaluates the fixed system invariants against the pipeline context and
/// system mode. Abstains when an invariant cannot be evaluated.
pub struct InvariantHead;

impl InvariantHead {
    pub fn new() -> Self {
        Self
    }

    fn requested_strictness(request: &ActionRequest) -> Option<Result<Strictness, ()>> {
        let value = request.context.get("requested_strictness")?;
        let parsed = match value.as_str() {
            Some("allow") => Ok(Strictness::Allow),
            Some("degrade") => Ok(Strictness::Degrade),
            Some("deny") => Ok(Strictness::Deny),
            _ => Err(()),
        };
        Some(parsed)
    }
}

impl Default for InvariantHead {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GateHead for InvariantHead {
    fn name(&self) -> &'static str {
        "invariant"
    }

    async fn evaluate(&self, request: &ActionRequest, ctx: &GateContext) -> HeadVerdict {
        if ctx.mode == SystemMode::Halted {
            return HeadVerdict::new(self.name(), Verdict::Deny, "system_halted");
        }

        // Invariant inputs must be structured; without them the head cannot
        // evaluate and must abstain rather than allow.
        if !request.context.is_object() && !request.context.is_null() {
            return HeadVerdict::new(self.name(), Verdict::Abstain, "invariant_inputs_unreadable");
        }

        // No action may itself attempt to lower system strictness.
        match Self::requested_strictness(request) {
            Some(Ok(requested)) if requested < ctx.strictness => {
                return HeadVerdict::new(self.name(), Verdict::Deny, "strictness_lowering_forbidden");
            }
            Some(Err(())) => {
                return HeadVerdict::new(self.name(), Verdict::Abstain, "strictness_claim_unreadable");
            }
            _ => {}
        }

        // High-impact actions require a ballot at least as large as the
        // configured minimum.
        if request.class == ActionClass::HighImpact && ctx.ballot_n < ctx.high_impact_min_n {
            return HeadVerdict::new(self.name(), Verdict::Deny, "quorum_below_minimum");
        }

        HeadVerdict::new(self.name(), Verdict::Allow, "invariants_hold")
    }
}

/// One full-gate ballot participant: evaluates every member concern and
/// votes the strictest result. Larger ballots are built from replicas of
/// this head so that a single concern's denial is never outvoted by heads
/// that do not examine it.
pub struct CompositeHead {
    name: String,
    members: Vec<Arc<dyn GateHead>>,
}

impl CompositeHead {
    pub fn new(name: impl Into<String>, members: Vec<Arc<dyn GateHead>>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }
}

#[async_trait]
impl GateHead for CompositeHead {
    fn name(&self) -> &'static str {
        // Ballot replicas need distinct display names but the trait hands
        // out static strings; the composite reports through `evaluate`.
        "composite"
    }

    async fn evaluate(&self, request: &ActionRequest, ctx: &GateContext) -> HeadVerdict {
        let evaluations = self.members.iter().map(|m| m.evaluate(request, ctx));
        let verdicts = futures::future::join_all(evaluations).await;

        let mut folded = HeadVerdict::new(self.name.clone(), Verdict::Allow, "all_members_allow");
        for member in verdicts {
            let fold = match (folded.verdict, member.verdict) {
                (Verdict::Deny, _) => false,
                (_, Verdict::Deny) => true,
                (Verdict::Abstain, _) => false,
                (_, Verdict::Abstain) => true,
                (Verdict::Degrade, _) => false,
                (_, Verdict::Degrade) => true,
                _ => false,
            };
            if fold {
                folded = HeadVerdict::new(
                    self.name.clone(),
                    member.verdict,
                    format!("{}:{}", member.head, member.reason),
                );
            }
        }
        folded
    }
}
