//! Aegis Types - shared vocabulary of the governance substrate
//!
//! Every state-mutating action in the system is authorized through the same
//! staged pipeline, and every component of that pipeline speaks the types
//! defined here: verdicts, decisions, strictness, system mode, and the
//! enumerated error taxonomy.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub String);
impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}
impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);
impl RequestId {
    pub fn generate() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4()))
    }
}
impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub String);
impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}
impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key a mutation targets. Commits on the same entity serialize FIFO;
/// commits on different entities proceed independently.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey(pub String);
impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}
impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordinal severity of an outcome. Within one pipeline traversal the
/// strictness may rise but never fall.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Strictness {
    Allow,
    Degrade,
    Deny,
}

/// Verdict emitted by a single gate head for one traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Allow,
    Deny,
    Abstain,
    Degrade,
}

impl Verdict {
    /// Strictness contribution of this verdict. Abstain carries none: it is
    /// never allowed to count as an implicit Allow.
    pub fn strictness(&self) -> Option<Strictness> {
        match self {
            Verdict::Allow => Some(Strictness::Allow),
            Verdict::Degrade => Some(Strictness::Degrade),
            Verdict::Deny => Some(Strictness::Deny),
            Verdict::Abstain => None,
        }
    }
}

/// A head verdict with its evidence payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeadVerdict {
    pub head: String,
    pub verdict: Verdict,
    pub reason: String,
}

impl HeadVerdict {
    pub fn new(head: impl Into<String>, verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            head: head.into(),
            verdict,
            reason: reason.into(),
        }
    }
}

/// Final outcome of a resolved action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Allow,
    Deny,
    Degrade,
}

impl Outcome {
    pub fn strictness(&self) -> Strictness {
        match self {
            Outcome::Allow => Strictness::Allow,
            Outcome::Degrade => Strictness::Degrade,
            Outcome::Deny => Strictness::Deny,
        }
    }

    /// Only Allow and Degrade outcomes are applied as effective mutations.
    pub fn is_effective(&self) -> bool {
        matches!(self, Outcome::Allow | Outcome::Degrade)
    }
}

/// Decision returned to the caller. Every resolved action, including a
/// denial, carries the ledger sequence number proving it was recorded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub request_id: RequestId,
    pub outcome: Outcome,
    pub reasons: Vec<String>,
    pub ledger_seq: u64,
    pub escalation_required: bool,
}

/// Operating mode of the substrate. Halted is terminal until an explicit
/// readiness re-validation succeeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMode {
    Normal,
    Degraded,
    Halted,
}

/// Action class selecting the quorum configuration for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionClass {
    Standard,
    HighImpact,
}

impl Default for ActionClass {
    fn default() -> Self {
        ActionClass::Standard
    }
}

/// Authorized scope of a capability: which action kinds on which resources.
/// Entries support `*` and trailing-`*` prefix wildcards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub action_kinds: BTreeSet<String>,
    pub resources: BTreeSet<String>,
}

impl Scope {
    pub fn new<A, R>(action_kinds: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            action_kinds: action_kinds.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn global() -> Self {
        Self::new(["*"], ["*"])
    }

    /// Whether this scope covers the given action kind and resource.
    pub fn covers(&self, action_kind: &str, resource: &str) -> bool {
        pattern_covers(&self.action_kinds, action_kind) && pattern_covers(&self.resources, resource)
    }
}

fn pattern_covers(patterns: &BTreeSet<String>, value: &str) -> bool {
    patterns.iter().any(|p| {
        p == "*" || p == value || (p.ends_with('*') && value.starts_with(p.trim_end_matches('*')))
    })
}

/// An inbound action request as it enters the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRequest {
    pub request_id: RequestId,
    pub actor: ActorId,
    pub action_kind: String,
    pub resource: String,
    pub class: ActionClass,
    pub context: serde_json::Value,
    /// Ed25519 signature by the actor over `signing_bytes()`.
    #[serde(with = "serde_bytes_vec")]
    pub signature: Vec<u8>,
}

impl ActionRequest {
    /// Canonical bytes the actor signs. Deliberately excludes the signature
    /// itself and anything the pipeline appends after ingress.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}",
            self.request_id, self.actor, self.action_kind, self.resource
        )
        .into_bytes()
    }

    /// BLAKE3 digest of the caller-supplied context, recorded in the ledger
    /// payload so the decision record binds the full context non-repudiably.
    pub fn context_digest(&self) -> String {
        let canonical =
            serde_json::to_string(&self.context).unwrap_or_else(|_| String::from("null"));
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }
}

mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Enumerated governance errors. Per-head and per-stage failures are folded
/// into verdicts and resolved by the quorum engine; only LedgerCorruption and
/// exhausted StorageIOFailure escalate to the SAFE-HALT controller.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GovernanceError {
    #[error("bad signature")]
    BadSignature,

    #[error("capability expired")]
    ExpiredCapability,

    #[error("capability scope does not cover the requested action")]
    ScopeMismatch,

    #[error("capability revoked for (subject, scope)")]
    CapabilityRevoked,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("quorum deadline elapsed before resolution")]
    QuorumTimeout,

    #[error("no outcome reached the agreement threshold")]
    QuorumSplit,

    #[error("ledger write conflict: {0}")]
    LedgerWriteConflict(String),

    #[error("ledger corruption at sequence {0}")]
    LedgerCorruption(u64),

    #[error("storage I/O failure: {0}")]
    StorageIOFailure(String),

    #[error("system is halted; action rejected without recording")]
    SystemHalted,
}

impl GovernanceError {
    /// Fatal errors force SAFE-HALT; everything else resolves into a verdict
    /// or a retriable result.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GovernanceError::LedgerCorruption(_) | GovernanceError::InvariantViolation(_)
        )
    }
}
