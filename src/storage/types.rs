//! Row types owned by storage.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fingerprint of a client's permanent public key (lowercase hex SHA-256).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// First 16 characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One-way derivation of a real network identity.
///
/// Travels as standard base64 in JSON.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IntermediaryId(Vec<u8>);

impl IntermediaryId {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the id carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base64 form, truncated for logs.
    pub fn short(&self) -> String {
        let encoded = BASE64.encode(&self.0);
        encoded[..encoded.len().min(12)].to_string()
    }
}

impl TryFrom<String> for IntermediaryId {
    type Error = base64::DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BASE64.decode(value).map(Self)
    }
}

impl From<IntermediaryId> for String {
    fn from(id: IntermediaryId) -> Self {
        BASE64.encode(id.0)
    }
}

/// Per-epoch derived identity reported by the gateway.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EphemeralId(pub i64);

impl std::fmt::Display for EphemeralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EphemeralId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A device registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Fingerprint of `public_key_pem`.
    pub fingerprint: Fingerprint,
    /// Push provider token for the device.
    pub token: String,
    /// Application the token belongs to.
    pub app_id: String,
    /// SPKI PEM of the client's permanent Ed25519 key.
    pub public_key_pem: String,
    /// When the token was (last) registered.
    pub registered_at: DateTime<Utc>,
}

/// An intermediary identity and the keys tracking it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedIdentity {
    /// The tracked intermediary identity.
    pub intermediary_id: IntermediaryId,
    /// Keys that asked to be notified for this identity.
    pub owners: BTreeSet<Fingerprint>,
    /// Epoch offset at registration.
    pub offset: i64,
    /// Address-space size in effect at registration.
    pub address_space_size: u8,
    /// When the identity was first tracked.
    pub registered_at: DateTime<Utc>,
}

/// Primary key of an ephemeral record.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EphemeralKey {
    /// Identity the record was derived from.
    pub intermediary_id: IntermediaryId,
    /// Epoch index.
    pub offset: i64,
}

/// One published generation of an ephemeral identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralRecord {
    /// Identity the record was derived from.
    pub intermediary_id: IntermediaryId,
    /// Derived ephemeral identity.
    pub ephemeral_id: EphemeralId,
    /// Epoch index.
    pub offset: i64,
    /// Address-space size used for the derivation.
    pub address_space_size: u8,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Fixed at creation; never re-derived.
    pub expires_at: DateTime<Utc>,
}

impl EphemeralRecord {
    /// Primary key of this record.
    pub fn key(&self) -> EphemeralKey {
        EphemeralKey {
            intermediary_id: self.intermediary_id.clone(),
            offset: self.offset,
        }
    }

    /// Whether the record is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
