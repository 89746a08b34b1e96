//! Locally trusted timestamp authority.
//!
//! Wall clocks may be skewed or adversarially set, so ordering evidence comes
//! from a signed token with a strictly increasing counter. The token binds a
//! payload hash to that counter; verification checks both the signature and
//! counter freshness against the authority's key.

use crate::{hash_fields, CryptoError, Digest, KeyStore};
use aegis_types::KeyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

const TSA_IDENTITY: &str = "aegis-tsa";

/// Signed, monotonically ordered timestamp token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampToken {
    pub counter: u64,
    pub payload_hash: Digest,
    pub issued_at: DateTime<Utc>,
    pub key_id: KeyId,
    pub signature: Vec<u8>,
}

impl TimestampToken {
    fn signing_bytes(counter: u64, payload_hash: &Digest, issued_at: &DateTime<Utc>) -> Vec<u8> {
        hash_fields(&[
            &counter.to_le_bytes(),
            payload_hash,
            issued_at.to_rfc3339().as_bytes(),
        ])
        .to_vec()
    }
}

/// Timestamp authority backed by the shared key store.
pub struct TimestampAuthority {
    keystore: std::sync::Arc<KeyStore>,
    counter: RwLock<u64>,
}

impl TimestampAuthority {
    /// Create the authority, generating its signing key if absent.
    pub fn new(keystore: std::sync::Arc<KeyStore>) -> Result<Self, CryptoError> {
        if !keystore.knows_identity(TSA_IDENTITY) {
            keystore.generate(TSA_IDENTITY)?;
        }
        Ok(Self {
            keystore,
            counter: RwLock::new(0),
        })
    }

    /// Issue a token over a payload hash. Counters never repeat or regress.
    pub fn timestamp(&self, payload_hash: Digest) -> Result<TimestampToken, CryptoError> {
        let counter = {
            let mut counter = self.counter.write().map_err(|_| CryptoError::LockError)?;
            *counter += 1;
            *counter
        };
        let issued_at = Utc::now();
        let bytes = TimestampToken::signing_bytes(counter, &payload_hash, &issued_at);
        let (key_id, signature) = self.keystore.sign(TSA_IDENTITY, &bytes)?;
        Ok(TimestampToken {
            counter,
            payload_hash,
            issued_at,
            key_id,
            signature,
        })
    }

    /// Verify a token's signature and that it matches the payload hash.
    pub fn verify(&self, token: &TimestampToken, payload_hash: &Digest) -> bool {
        if &token.payload_hash != payload_hash {
            return false;
        }
        let bytes =
            TimestampToken::signing_bytes(token.counter, &token.payload_hash, &token.issued_at);
        self.keystore.verify(&token.key_id, &bytes, &token.signature)
    }

    /// Last issued counter value.
    pub fn last_counter(&self) -> u64 {
        self.counter.read().map(|c| *c).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_bytes;
    use std::sync::Arc;

    #[test]
    fn tokens_are_strictly_ordered() {
        let keystore = Arc::new(KeyStore::new());
        let tsa = TimestampAuthority::new(keystore).unwrap();
        let t1 = tsa.timestamp(hash_bytes(b"a")).unwrap();
        let t2 = tsa.timestamp(hash_bytes(b"b")).unwrap();
        assert!(t2.counter > t1.counter);
    }

    #[test]
    fn token_verifies_against_payload() {
        let keystore = Arc::new(KeyStore::new());
        let tsa = TimestampAuthority::new(keystore).unwrap();
        let h = hash_bytes(b"payload");
        let token = tsa.timestamp(h).unwrap();
        assert!(tsa.verify(&token, &h));
        assert!(!tsa.verify(&token, &hash_bytes(b"other")));
    }

    #[test]
    fn tampered_counter_fails_verification() {
        let keystore = Arc::new(KeyStore::new());
        let tsa = TimestampAuthority::new(keystore).unwrap();
        let h = hash_bytes(b"payload");
        let mut token = tsa.timestamp(h).unwrap();
        token.counter += 1;
        assert!(!tsa.verify(&token, &h));
    }

    #[test]
    fn tokens_survive_authority_key_rotation() {
        let keystore = Arc::new(KeyStore::new());
        let tsa = TimestampAuthority::new(Arc::clone(&keystore)).unwrap();
        let h = hash_bytes(b"payload");
        let token = tsa.timestamp(h).unwrap();
        keystore.rotate("aegis-tsa").unwrap();
        // Old tokens keep verifying through the retired key.
        assert!(tsa.verify(&token, &h));
    }
}
