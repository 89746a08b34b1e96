//! Aegis Capability - the capability-token authority
//!
//! Capabilities are signed, scoped, time-bounded grants of authority.
//! Tokens are immutable once issued; verification is a pure function of the
//! token, the trusted key set, and the revocation set. Checks run in
//! cheapest-rejection order: signature, expiry, scope, revocation.

#![deny(unsafe_code)]

use aegis_crypto::{hash_fields, CryptoError, KeyStore};
use aegis_types::{ActorId, GovernanceError, KeyId, Scope};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Identity the authority signs tokens under.
pub const AUTHORITY_SIGNER: &str = "aegis-capability-authority";

/// Signed, scoped, expiring capability token. Immutable once issued.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub token_id: String,
    pub subject: ActorId,
    pub scope: Scope,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issuer_key_id: KeyId,
    pub signature: Vec<u8>,
}

impl CapabilityToken {
    /// Canonical bytes bound by the issuer signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let action_kinds = self
            .scope
            .action_kinds
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        let resources = self
            .scope
            .resources
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        hash_fields(&[
            self.token_id.as_bytes(),
            self.subject.0.as_bytes(),
            action_kinds.as_bytes(),
            resources.as_bytes(),
            self.issued_at.to_rfc3339().as_bytes(),
            self.expires_at.to_rfc3339().as_bytes(),
        ])
        .to_vec()
    }
}

/// Outcome of a capability check: authorized, or a specific denial carried
/// into the gate plane as verdict evidence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityCheck {
    pub authorized: bool,
    pub token_id: Option<String>,
    pub denial: Option<GovernanceError>,
}

impl CapabilityCheck {
    fn ok(token_id: &str) -> Self {
        Self {
            authorized: true,
            token_id: Some(token_id.to_string()),
            denial: None,
        }
    }

    fn denied(token_id: &str, denial: GovernanceError) -> Self {
        Self {
            authorized: false,
            token_id: Some(token_id.to_string()),
            denial: Some(denial),
        }
    }
}

/// The capability authority: issues, verifies, and revokes tokens.
pub struct CapabilityAuthority {
    keystore: Arc<KeyStore>,
    revocations: RwLock<HashSet<(ActorId, Scope)>>,
}

impl CapabilityAuthority {
    pub fn new(keystore: Arc<KeyStore>) -> Result<Self, CapabilityError> {
        if !keystore.knows_identity(AUTHORITY_SIGNER) {
            keystore.generate(AUTHORITY_SIGNER)?;
        }
        Ok(Self {
            keystore,
            revocations: RwLock::new(HashSet::new()),
        })
    }

    /// Issue a token for a subject. The issuing key's pruning horizon is
    /// extended to outlive the token.
    pub fn issue(
        &self,
        subject: ActorId,
        scope: Scope,
        ttl: Duration,
    ) -> Result<CapabilityToken, CapabilityError> {
        let issued_at = Utc::now();
        let mut token = CapabilityToken {
            token_id: format!("cap-{}", uuid::Uuid::new_v4()),
            subject,
            scope,
            issued_at,
            expires_at: issued_at + ttl,
            issuer_key_id: self.keystore.active_key(AUTHORITY_SIGNER)?,
            signature: vec![],
        };
        let (key_id, signature) = self.keystore.sign(AUTHORITY_SIGNER, &token.signing_bytes())?;
        token.issuer_key_id = key_id.clone();
        token.signature = signature;
        self.keystore.note_issued_ttl(&key_id, ttl)?;
        tracing::debug!(token_id = %token.token_id, subject = %token.subject, "issued capability");
        Ok(token)
    }

    /// Verify a token against a requested action. Short-circuits with the
    /// cheapest failing check; the specific reason feeds head evidence.
    pub fn verify(
        &self,
        token: &CapabilityToken,
        action_kind: &str,
        resource: &str,
        now: DateTime<Utc>,
    ) -> Result<CapabilityCheck, CapabilityError> {
        if !self
            .keystore
            .verify(&token.issuer_key_id, &token.signing_bytes(), &token.signature)
        {
            return Ok(CapabilityCheck::denied(
                &token.token_id,
                GovernanceError::BadSignature,
            ));
        }
        if now >= token.expires_at {
            return Ok(CapabilityCheck::denied(
                &token.token_id,
                GovernanceError::ExpiredCapability,
            ));
        }
        if !token.scope.covers(action_kind, resource) {
            return Ok(CapabilityCheck::denied(
                &token.token_id,
                GovernanceError::ScopeMismatch,
            ));
        }
        let revocations = self
            .revocations
            .read()
            .map_err(|_| CapabilityError::LockError)?;
        if revocations.contains(&(token.subject.clone(), token.scope.clone())) {
            return Ok(CapabilityCheck::denied(
                &token.token_id,
                GovernanceError::CapabilityRevoked,
            ));
        }
        Ok(CapabilityCheck::ok(&token.token_id))
    }

    /// Revoke every token matching (subject, scope). Tokens are immutable,
    /// so revocation lives in a set consulted by `verify`.
    pub fn revoke(&self, subject: ActorId, scope: Scope) -> Result<(), CapabilityError> {
        let mut revocations = self
            .revocations
            .write()
            .map_err(|_| CapabilityError::LockError)?;
        revocations.insert((subject.clone(), scope));
        tracing::info!(subject = %subject, "capability revoked");
        Ok(())
    }

    /// Snapshot of the revocation set.
    pub fn revocations(&self) -> Result<Vec<(ActorId, Scope)>, CapabilityError> {
        let revocations = self
            .revocations
            .read()
            .map_err(|_| CapabilityError::LockError)?;
        Ok(revocations.iter().cloned().collect())
    }
}

/// Authority infrastructure errors (distinct from verification denials,
/// which are data, not faults).
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("lock poisoned")]
    LockError,
}
