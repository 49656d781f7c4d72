//! Client key handling and signed-request digests.
//!
//! This module handles:
//! - Parsing SPKI PEM Ed25519 verifying keys sent by clients
//! - Key fingerprints (the primary key of a registration)
//! - Canonical digests of every signed request
//! - Signature verification, plus signing helpers for clients and tests
//!
//! # Digest layout
//!
//! Every signed message is the SHA-256 of its fields in order. Variable
//! length fields are prefixed with their length as a big-endian `u32`;
//! timestamps are big-endian `i64` Unix nanoseconds. The Ed25519 signature
//! covers the 32-byte digest.
//!
//! ```text
//! registrar:  len‖pem ‖ registration_ts
//! token:      len‖token ‖ len‖app_id ‖ request_ts ‖ len‖tag
//! identity:   len‖iid ‖ request_ts ‖ len‖tag
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::storage::{Fingerprint, IntermediaryId};

/// Errors from key parsing and signature checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The PEM block is not an Ed25519 SPKI public key.
    MalformedKey(String),
    /// The signature is not valid base64 or has the wrong length.
    MalformedSignature(String),
    /// The signature does not verify.
    InvalidSignature,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedKey(msg) => write!(f, "Malformed public key: {msg}"),
            Self::MalformedSignature(msg) => write!(f, "Malformed signature: {msg}"),
            Self::InvalidSignature => write!(f, "Signature verification failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Parse an SPKI PEM Ed25519 verifying key.
pub fn parse_public_key_pem(pem: &str) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_public_key_pem(pem.trim())
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))
}

/// Encode a verifying key as SPKI PEM.
pub fn public_key_pem(key: &VerifyingKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))
}

/// Fingerprint of a verifying key: lowercase hex SHA-256 of its 32 bytes.
pub fn fingerprint(key: &VerifyingKey) -> Fingerprint {
    let hash = Sha256::digest(key.as_bytes());
    Fingerprint(hash.iter().map(|b| format!("{b:02x}")).collect())
}

fn put_field(hasher: &mut Sha256, field: &[u8]) {
    let len = u32::try_from(field.len()).unwrap_or(u32::MAX);
    hasher.update(len.to_be_bytes());
    hasher.update(field);
}

/// Digest a permissioning authority signs to approve a client key.
pub fn registrar_digest(registration_timestamp: i64, public_key_pem: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    put_field(&mut hasher, public_key_pem.as_bytes());
    hasher.update(registration_timestamp.to_be_bytes());
    hasher.finalize().into()
}

/// Digest of a (un)register-token request.
pub fn token_digest(token: &str, app_id: &str, request_timestamp: i64, tag: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    put_field(&mut hasher, token.as_bytes());
    put_field(&mut hasher, app_id.as_bytes());
    hasher.update(request_timestamp.to_be_bytes());
    put_field(&mut hasher, tag.as_bytes());
    hasher.finalize().into()
}

/// Digest of a (un)register-tracked-id request.
pub fn identity_digest(
    intermediary_id: &IntermediaryId,
    request_timestamp: i64,
    tag: &str,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    put_field(&mut hasher, intermediary_id.as_bytes());
    hasher.update(request_timestamp.to_be_bytes());
    put_field(&mut hasher, tag.as_bytes());
    hasher.finalize().into()
}

/// Verify a base64 signature over a digest.
pub fn verify_digest(
    key: &VerifyingKey,
    digest: &[u8; 32],
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let bytes = BASE64
        .decode(signature_b64)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    key.verify(digest, &signature)
        .map_err(|_verify| CryptoError::InvalidSignature)
}

/// Sign a digest, returning the base64 signature.
pub fn sign_digest(key: &SigningKey, digest: &[u8; 32]) -> String {
    BASE64.encode(key.sign(digest).to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn signing_key() -> SigningKey {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        SigningKey::from_bytes(&secret)
    }

    #[test]
    fn test_pem_round_trip_and_fingerprint() {
        let key = signing_key();
        let pem = public_key_pem(&key.verifying_key()).expect("encode pem");
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        let parsed = parse_public_key_pem(&pem).expect("parse pem");
        assert_eq!(parsed, key.verifying_key());

        let fp = fingerprint(&parsed);
        assert_eq!(fp.0.len(), 64);
        assert!(fp.0.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_public_key_pem("not a key"),
            Err(CryptoError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let key = signing_key();
        let digest = token_digest("tok", "app", 42, "register-token");
        let sig = sign_digest(&key, &digest);
        assert!(verify_digest(&key.verifying_key(), &digest, &sig).is_ok());

        let other = token_digest("tok", "app", 43, "register-token");
        assert_eq!(
            verify_digest(&key.verifying_key(), &other, &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_rejects_malformed_signature() {
        let key = signing_key();
        let digest = registrar_digest(1, "pem");
        assert!(matches!(
            verify_digest(&key.verifying_key(), &digest, "%%%"),
            Err(CryptoError::MalformedSignature(_))
        ));
        assert!(matches!(
            verify_digest(&key.verifying_key(), &digest, &BASE64.encode([1u8; 10])),
            Err(CryptoError::MalformedSignature(_))
        ));
    }

    #[test]
    fn test_digest_fields_are_length_prefixed() {
        // Shifting bytes between token and app id must change the digest.
        assert_ne!(
            token_digest("ab", "c", 1, "t"),
            token_digest("a", "bc", 1, "t")
        );
    }

    #[test]
    fn test_tags_separate_register_and_unregister() {
        let iid = IntermediaryId::new(b"abc123".to_vec());
        assert_ne!(
            identity_digest(&iid, 1, crate::constants::REGISTER_TRACKED_ID_TAG),
            identity_digest(&iid, 1, crate::constants::UNREGISTER_TRACKED_ID_TAG)
        );
    }
}
