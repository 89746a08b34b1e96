//! Aegis Crypto - the trust root of the governance substrate
//!
//! Ed25519 signing and verification (32-byte keys, 64-byte non-malleable
//! signatures), BLAKE3 hashing, key rotation with a monotonic trust rule, and
//! a locally trusted timestamp authority whose tokens order events
//! independently of wall clocks.
//!
//! Private key material never leaves this crate. Components hold a
//! [`KeyStore`] handle and ask it to sign; nothing else can observe a secret.

#![deny(unsafe_code)]

pub mod keystore;
pub mod timestamp;

pub use keystore::{KeyRecord, KeyState, KeyStore, PublicKeyInfo};
pub use timestamp::{TimestampAuthority, TimestampToken};

use thiserror::Error;

/// 32-byte BLAKE3 digest used throughout the ledger and quorum plane.
pub type Digest = [u8; 32];

/// Hash arbitrary bytes into the substrate's digest type.
pub fn hash_bytes(bytes: &[u8]) -> Digest {
    *blake3::hash(bytes).as_bytes()
}

/// Hash a sequence of byte fields with unambiguous framing.
pub fn hash_fields(fields: &[&[u8]]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    for field in fields {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field);
    }
    *hasher.finalize().as_bytes()
}

/// Lowercase hex rendering of a digest for logs and records.
pub fn hex_digest(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Crypto-plane errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("key {0} is retired and may no longer sign")]
    RetiredKey(String),

    #[error("malformed key or signature material: {0}")]
    Malformed(String),

    #[error("lock poisoned")]
    LockError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_fields_framing_is_unambiguous() {
        // ("ab", "c") and ("a", "bc") must not collide.
        let h1 = hash_fields(&[b"ab", b"c"]);
        let h2 = hash_fields(&[b"a", b"bc"]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_bytes_is_deterministic() {
        assert_eq!(hash_bytes(b"payload"), hash_bytes(b"payload"));
        assert_ne!(hash_bytes(b"payload"), hash_bytes(b"payload2"));
    }

    #[test]
    fn hex_digest_renders_lowercase_hex() {
        let digest = hash_bytes(b"payload");
        let rendered = hex_digest(&digest);
        assert_eq!(rendered.len(), 64);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
