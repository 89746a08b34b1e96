//! Aegis Service - bootstrap, observability, and the external boundary
//!
//! Wires the whole substrate together: trust root, ledger, capability
//! authority, gate ballots, pipeline, and the SAFE-HALT machinery. External
//! collaborators interact exclusively through `AegisService`.

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod detector;
pub mod service;

pub use bootstrap::{BootstrapError, GenesisCoordinator, ReadinessGate, SafeHaltController};
pub use detector::{DetectorConfig, FailureDetector};
pub use service::{
    AegisService, BootError, ServiceConfig, ISSUE_CAPABILITY_KIND, REVOKE_CAPABILITY_KIND,
};

/// Install the process-wide subscriber. Call once, from the binary edge.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
