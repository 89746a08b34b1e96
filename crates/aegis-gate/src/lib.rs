//! Aegis Gate - the gate plane
//!
//! Three independent heads evaluate every action concurrently: Identity
//! (actor signature), Capability (token authority), and Invariant (system
//! rules). Their verdicts are aggregated by a Byzantine-fault-tolerant
//! quorum engine; no single head can allow an action on its own, and a head
//! that fails or misses the ballot deadline counts as Abstain, never as an
//! implicit Allow.

#![deny(unsafe_code)]

pub mod heads;
pub mod quorum;

pub use heads::{
    CapabilityHead, CompositeHead, GateContext, GateHead, IdentityHead, InvariantHead,
};
pub use quorum::{BallotResult, QuorumConfig, QuorumEngine, QuorumError, Resolution};
