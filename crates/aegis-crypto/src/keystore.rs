//! Key lifecycle: generation, signing, verification, rotation.
//!
//! Rotation never weakens trust: a rotated key moves to `Retired` and keeps
//! verifying until every token it could have signed has expired. Pruning a
//! retired key before that horizon is refused.

use crate::CryptoError;
use aegis_types::KeyId;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use zeroize::Zeroizing;

/// Lifecycle state of a signing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Active,
    Retired,
}

/// Public view of a stored key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub key_id: KeyId,
    pub identity: String,
    pub public_key: [u8; 32],
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// Internal key record. The signing half stays private to this module.
pub struct KeyRecord {
    info: PublicKeyInfo,
    signing_key: SigningKey,
    /// Longest TTL ever issued under this key; bounds the pruning horizon.
    max_issued_ttl: Duration,
}

impl KeyRecord {
    pub fn info(&self) -> &PublicKeyInfo {
        &self.info
    }
}

/// In-memory key store owning all private key material.
pub struct KeyStore {
    keys: RwLock<HashMap<KeyId, KeyRecord>>,
    /// identity -> currently active key
    active: RwLock<HashMap<String, KeyId>>,
    counter: RwLock<u64>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            counter: RwLock::new(0),
        }
    }

    fn next_key_id(&self, identity: &str) -> Result<KeyId, CryptoError> {
        let mut counter = self.counter.write().map_err(|_| CryptoError::LockError)?;
        *counter += 1;
        Ok(KeyId::new(format!("key-{}-{:04}", identity, *counter)))
    }

    /// Generate a fresh keypair for an identity and mark it active.
    pub fn generate(&self, identity: &str) -> Result<KeyId, CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        self.install(identity, signing_key)
    }

    /// Deterministic key construction from a seed. The seed copy is wiped
    /// once the signing key has been built.
    pub fn generate_from_seed(&self, identity: &str, seed: [u8; 32]) -> Result<KeyId, CryptoError> {
        let seed = Zeroizing::new(seed);
        let signing_key = SigningKey::from_bytes(&seed);
        self.install(identity, signing_key)
    }

    fn install(&self, identity: &str, signing_key: SigningKey) -> Result<KeyId, CryptoError> {
        let key_id = self.next_key_id(identity)?;
        let record = KeyRecord {
            info: PublicKeyInfo {
                key_id: key_id.clone(),
                identity: identity.to_string(),
                public_key: signing_key.verifying_key().to_bytes(),
                state: KeyState::Active,
                created_at: Utc::now(),
                retired_at: None,
            },
            signing_key,
            max_issued_ttl: Duration::zero(),
        };

        let mut keys = self.keys.write().map_err(|_| CryptoError::LockError)?;
        let mut active = self.active.write().map_err(|_| CryptoError::LockError)?;

        // Installing a new active key retires the previous one.
        if let Some(old_id) = active.insert(identity.to_string(), key_id.clone()) {
            if let Some(old) = keys.get_mut(&old_id) {
                old.info.state = KeyState::Retired;
                old.info.retired_at = Some(Utc::now());
            }
        }
        keys.insert(key_id.clone(), record);

        tracing::info!(identity, key_id = %key_id, "installed active signing key");
        Ok(key_id)
    }

    /// Rotate the active key of an identity. The old key keeps verifying.
    pub fn rotate(&self, identity: &str) -> Result<KeyId, CryptoError> {
        {
            let active = self.active.read().map_err(|_| CryptoError::LockError)?;
            if !active.contains_key(identity) {
                return Err(CryptoError::UnknownIdentity(identity.to_string()));
            }
        }
        self.generate(identity)
    }

    /// Currently active key id for an identity.
    pub fn active_key(&self, identity: &str) -> Result<KeyId, CryptoError> {
        let active = self.active.read().map_err(|_| CryptoError::LockError)?;
        active
            .get(identity)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownIdentity(identity.to_string()))
    }

    /// Sign a payload with the identity's active key.
    pub fn sign(&self, identity: &str, payload: &[u8]) -> Result<(KeyId, Vec<u8>), CryptoError> {
        let key_id = self.active_key(identity)?;
        let keys = self.keys.read().map_err(|_| CryptoError::LockError)?;
        let record = keys
            .get(&key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.0.clone()))?;
        if record.info.state != KeyState::Active {
            return Err(CryptoError::RetiredKey(key_id.0.clone()));
        }
        let signature: Signature = record.signing_key.sign(payload);
        Ok((key_id, signature.to_bytes().to_vec()))
    }

    /// Verify a signature against a stored key (active or retired).
    /// Verification is a pure function of the material; an unknown key is
    /// simply an invalid signature from the caller's perspective.
    pub fn verify(&self, key_id: &KeyId, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(keys) = self.keys.read() else {
            return false;
        };
        let Some(record) = keys.get(key_id) else {
            return false;
        };
        verify_with(&record.info.public_key, payload, signature)
    }

    /// Record that a token with this TTL was issued under the key, extending
    /// the horizon before which the key must not be pruned.
    pub fn note_issued_ttl(&self, key_id: &KeyId, ttl: Duration) -> Result<(), CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::LockError)?;
        let record = keys
            .get_mut(key_id)
            .ok_or_else(|| CryptoError::UnknownKey(key_id.0.clone()))?;
        if ttl > record.max_issued_ttl {
            record.max_issued_ttl = ttl;
        }
        Ok(())
    }

    /// Drop retired keys whose issued tokens have all expired. Returns the
    /// pruned key ids. Active keys and keys still inside their horizon stay.
    pub fn prune_retired(&self, now: DateTime<Utc>) -> Result<Vec<KeyId>, CryptoError> {
        let mut keys = self.keys.write().map_err(|_| CryptoError::LockError)?;
        let prunable: Vec<KeyId> = keys
            .values()
            .filter(|r| {
                r.info.state == KeyState::Retired
                    && r.info
                        .retired_at
                        .map(|t| now > t + r.max_issued_ttl)
                        .unwrap_or(false)
            })
            .map(|r| r.info.key_id.clone())
            .collect();
        for key_id in &prunable {
            keys.remove(key_id);
            tracing::info!(key_id = %key_id, "pruned retired key past its token horizon");
        }
        Ok(prunable)
    }

    /// Public info for a key, if known.
    pub fn public_info(&self, key_id: &KeyId) -> Result<Option<PublicKeyInfo>, CryptoError> {
        let keys = self.keys.read().map_err(|_| CryptoError::LockError)?;
        Ok(keys.get(key_id).map(|r| r.info.clone()))
    }

    /// All known public keys (trusted key set view).
    pub fn trusted_keys(&self) -> Result<Vec<PublicKeyInfo>, CryptoError> {
        let keys = self.keys.read().map_err(|_| CryptoError::LockError)?;
        Ok(keys.values().map(|r| r.info.clone()).collect())
    }

    /// Whether any key is registered for this identity.
    pub fn knows_identity(&self, identity: &str) -> bool {
        self.active
            .read()
            .map(|a| a.contains_key(identity))
            .unwrap_or(false)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify a detached Ed25519 signature against raw public key bytes.
pub fn verify_with(public_key: &[u8; 32], payload: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(payload, &signature).is_ok()
}
