//! Signed client registration.
//!
//! Four operations let a client manage its device token and the
//! intermediary identities it wants to be notified for. Every request
//! carries a timestamp and a signature by the client's permanent key;
//! registering operations additionally carry an approval by a trusted
//! permissioning authority.
//!
//! # Checks, in order
//!
//! 1. Freshness: requests older than [`REQUEST_FRESHNESS_WINDOW`] are
//!    rejected before any signature is looked at.
//! 2. Shape: empty fields and unparseable keys or signatures.
//! 3. Authority approval (register operations only).
//! 4. The client's own signature over the request fields and a domain tag.
//!
//! Only then is storage touched. Unregistering something that is not
//! there succeeds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::authority::SharedAuthorityKeys;
use crate::clock::SharedClock;
use crate::constants::{
    REGISTER_TOKEN_TAG, REGISTER_TRACKED_ID_TAG, REQUEST_FRESHNESS_WINDOW, UNREGISTER_TOKEN_TAG,
    UNREGISTER_TRACKED_ID_TAG,
};
use crate::crypto::{self, CryptoError};
use crate::epoch::EpochManager;
use crate::storage::{IntermediaryId, SharedStorage, StorageError, User};

/// Why a registration request was refused.
#[derive(Debug)]
pub enum RegistrationError {
    /// The request timestamp is too old.
    StaleRequest,
    /// The key is not approved by a trusted authority.
    UntrustedKey,
    /// The client's signature does not verify.
    BadSignature,
    /// A field is empty or cannot be decoded.
    MalformedRequest(String),
    /// The key has no registered device token.
    NotRegistered,
    /// Storage failed.
    Storage(StorageError),
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaleRequest => write!(f, "Request timestamp is outside the freshness window"),
            Self::UntrustedKey => write!(f, "Key is not approved by a trusted authority"),
            Self::BadSignature => write!(f, "Request signature is invalid"),
            Self::MalformedRequest(msg) => write!(f, "Malformed request: {msg}"),
            Self::NotRegistered => write!(f, "No device token registered for this key"),
            Self::Storage(e) => write!(f, "Storage failure: {e}"),
        }
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for RegistrationError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Authority approval of a client key, presented with register requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrarApproval {
    /// SPKI PEM of the approved client key.
    pub public_key_pem: String,
    /// When the authority approved the key (Unix nanoseconds).
    pub registration_timestamp: i64,
    /// Authority signature over `(registration_timestamp, public_key_pem)`.
    pub registrar_signature: String,
}

impl RegistrarApproval {
    /// Approve `public_key_pem` as the authority holding `authority`.
    pub fn issue(authority: &SigningKey, public_key_pem: &str, registration_timestamp: i64) -> Self {
        let digest = crypto::registrar_digest(registration_timestamp, public_key_pem);
        Self {
            public_key_pem: public_key_pem.to_string(),
            registration_timestamp,
            registrar_signature: crypto::sign_digest(authority, &digest),
        }
    }
}

/// Register (or replace) the device token for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterTokenRequest {
    /// SPKI PEM of the client's permanent key.
    pub public_key_pem: String,
    /// Push provider token.
    pub token: String,
    /// Application the token belongs to.
    pub app_id: String,
    /// When the client signed the request (Unix nanoseconds).
    pub request_timestamp: i64,
    /// When the authority approved the key (Unix nanoseconds).
    pub registration_timestamp: i64,
    /// Authority signature over the key.
    pub registrar_signature: String,
    /// Client signature over the token fields.
    pub token_signature: String,
}

impl RegisterTokenRequest {
    /// Build and sign a request with `client`.
    pub fn sign(
        client: &SigningKey,
        approval: &RegistrarApproval,
        token: &str,
        app_id: &str,
        request_timestamp: i64,
    ) -> Self {
        let digest = crypto::token_digest(token, app_id, request_timestamp, REGISTER_TOKEN_TAG);
        Self {
            public_key_pem: approval.public_key_pem.clone(),
            token: token.to_string(),
            app_id: app_id.to_string(),
            request_timestamp,
            registration_timestamp: approval.registration_timestamp,
            registrar_signature: approval.registrar_signature.clone(),
            token_signature: crypto::sign_digest(client, &digest),
        }
    }
}

/// Start tracking an intermediary identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterTrackedIdRequest {
    /// SPKI PEM of the client's permanent key.
    pub public_key_pem: String,
    /// Intermediary identity to track (base64).
    pub tracked_id: IntermediaryId,
    /// When the client signed the request (Unix nanoseconds).
    pub request_timestamp: i64,
    /// When the authority approved the key (Unix nanoseconds).
    pub registration_timestamp: i64,
    /// Authority signature over the key.
    pub registrar_signature: String,
    /// Client signature over the identity.
    pub identity_signature: String,
}

impl RegisterTrackedIdRequest {
    /// Build and sign a request with `client`.
    pub fn sign(
        client: &SigningKey,
        approval: &RegistrarApproval,
        tracked_id: &IntermediaryId,
        request_timestamp: i64,
    ) -> Self {
        let digest =
            crypto::identity_digest(tracked_id, request_timestamp, REGISTER_TRACKED_ID_TAG);
        Self {
            public_key_pem: approval.public_key_pem.clone(),
            tracked_id: tracked_id.clone(),
            request_timestamp,
            registration_timestamp: approval.registration_timestamp,
            registrar_signature: approval.registrar_signature.clone(),
            identity_signature: crypto::sign_digest(client, &digest),
        }
    }
}

/// Remove the device token for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterTokenRequest {
    /// SPKI PEM of the client's permanent key.
    pub public_key_pem: String,
    /// Token to remove.
    pub token: String,
    /// Application the token belongs to.
    pub app_id: String,
    /// When the client signed the request (Unix nanoseconds).
    pub request_timestamp: i64,
    /// Client signature over the token fields.
    pub token_signature: String,
}

impl UnregisterTokenRequest {
    /// Build and sign a request with `client`.
    pub fn sign(client: &SigningKey, token: &str, app_id: &str, request_timestamp: i64) -> Self {
        let digest = crypto::token_digest(token, app_id, request_timestamp, UNREGISTER_TOKEN_TAG);
        Self {
            public_key_pem: crypto::public_key_pem(&client.verifying_key()).unwrap_or_default(),
            token: token.to_string(),
            app_id: app_id.to_string(),
            request_timestamp,
            token_signature: crypto::sign_digest(client, &digest),
        }
    }
}

/// Stop tracking an intermediary identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterTrackedIdRequest {
    /// SPKI PEM of the client's permanent key.
    pub public_key_pem: String,
    /// Intermediary identity to stop tracking (base64).
    pub tracked_id: IntermediaryId,
    /// When the client signed the request (Unix nanoseconds).
    pub request_timestamp: i64,
    /// Client signature over the identity.
    pub identity_signature: String,
}

impl UnregisterTrackedIdRequest {
    /// Build and sign a request with `client`.
    pub fn sign(client: &SigningKey, tracked_id: &IntermediaryId, request_timestamp: i64) -> Self {
        let digest =
            crypto::identity_digest(tracked_id, request_timestamp, UNREGISTER_TRACKED_ID_TAG);
        Self {
            public_key_pem: crypto::public_key_pem(&client.verifying_key()).unwrap_or_default(),
            tracked_id: tracked_id.clone(),
            request_timestamp,
            identity_signature: crypto::sign_digest(client, &digest),
        }
    }
}

/// Unix nanoseconds of `at`, saturating outside the representable range.
pub fn unix_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Validates signed requests and applies them to storage.
pub struct Registrar {
    storage: SharedStorage,
    authorities: SharedAuthorityKeys,
    authority_id: String,
    clock: SharedClock,
    epochs: Arc<EpochManager>,
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("authority_id", &self.authority_id)
            .finish_non_exhaustive()
    }
}

impl Registrar {
    /// Create a registrar trusting approvals by `authority_id`.
    pub fn new(
        storage: SharedStorage,
        authorities: SharedAuthorityKeys,
        authority_id: impl Into<String>,
        clock: SharedClock,
        epochs: Arc<EpochManager>,
    ) -> Self {
        Self {
            storage,
            authorities,
            authority_id: authority_id.into(),
            clock,
            epochs,
        }
    }

    /// Register or replace the device token of the signing key.
    pub async fn register_token(&self, req: &RegisterTokenRequest) -> Result<(), RegistrationError> {
        self.check_fresh(req.request_timestamp)?;
        require_non_empty("token", &req.token)?;
        self.check_approval(
            &req.public_key_pem,
            req.registration_timestamp,
            &req.registrar_signature,
        )?;
        let key = parse_key(&req.public_key_pem)?;
        let digest = crypto::token_digest(
            &req.token,
            &req.app_id,
            req.request_timestamp,
            REGISTER_TOKEN_TAG,
        );
        check_signature(&key, &digest, &req.token_signature)?;

        let fingerprint = crypto::fingerprint(&key);
        let replaced = self
            .storage
            .register_token(User {
                fingerprint: fingerprint.clone(),
                token: req.token.clone(),
                app_id: req.app_id.clone(),
                public_key_pem: req.public_key_pem.clone(),
                registered_at: self.clock.now(),
            })
            .await?;

        match replaced {
            Some(old) if old != req.token => log::info!(
                "[Registration] Replaced token for {} ({}... → {}...)",
                fingerprint.short(),
                token_prefix(&old),
                token_prefix(&req.token)
            ),
            Some(_) => log::debug!("[Registration] Token unchanged for {}", fingerprint.short()),
            None => log::info!(
                "[Registration] Registered token for {} (app {})",
                fingerprint.short(),
                req.app_id
            ),
        }
        Ok(())
    }

    /// Track an intermediary identity for the signing key.
    ///
    /// The identity gets its record for the current epoch before this
    /// returns, unless that write fails; the creator pass then retries.
    pub async fn register_tracked_id(
        &self,
        req: &RegisterTrackedIdRequest,
    ) -> Result<(), RegistrationError> {
        self.check_fresh(req.request_timestamp)?;
        require_non_empty_id(&req.tracked_id)?;
        self.check_approval(
            &req.public_key_pem,
            req.registration_timestamp,
            &req.registrar_signature,
        )?;
        let key = parse_key(&req.public_key_pem)?;
        let digest = crypto::identity_digest(
            &req.tracked_id,
            req.request_timestamp,
            REGISTER_TRACKED_ID_TAG,
        );
        check_signature(&key, &digest, &req.identity_signature)?;

        let fingerprint = crypto::fingerprint(&key);
        if self.storage.get_user(&fingerprint).await?.is_none() {
            return Err(RegistrationError::NotRegistered);
        }

        let snapshot = self.epochs.snapshot();
        let identity = self
            .storage
            .register_tracked_id(
                &req.tracked_id,
                &fingerprint,
                snapshot.offset,
                snapshot.address_space_size,
                self.clock.now(),
            )
            .await?;
        log::info!(
            "[Registration] {} now tracks {} ({} owner(s))",
            fingerprint.short(),
            req.tracked_id.short(),
            identity.owners.len()
        );

        if let Err(e) = self.epochs.create_for(&identity, &snapshot).await {
            log::warn!(
                "[Registration] Immediate epoch record for {} failed, creator pass will retry: {e}",
                req.tracked_id.short()
            );
        }
        Ok(())
    }

    /// Remove the device token of the signing key if it matches.
    pub async fn unregister_token(
        &self,
        req: &UnregisterTokenRequest,
    ) -> Result<(), RegistrationError> {
        self.check_fresh(req.request_timestamp)?;
        require_non_empty("token", &req.token)?;
        let key = parse_key(&req.public_key_pem)?;
        let digest = crypto::token_digest(
            &req.token,
            &req.app_id,
            req.request_timestamp,
            UNREGISTER_TOKEN_TAG,
        );
        check_signature(&key, &digest, &req.token_signature)?;

        let fingerprint = crypto::fingerprint(&key);
        if self.storage.unregister_token(&req.token, &fingerprint).await? {
            log::info!("[Registration] Unregistered token for {}", fingerprint.short());
        } else {
            log::debug!(
                "[Registration] Nothing to unregister for {} ({}...)",
                fingerprint.short(),
                token_prefix(&req.token)
            );
        }
        Ok(())
    }

    /// Stop tracking an intermediary identity for the signing key.
    pub async fn unregister_tracked_id(
        &self,
        req: &UnregisterTrackedIdRequest,
    ) -> Result<(), RegistrationError> {
        self.check_fresh(req.request_timestamp)?;
        require_non_empty_id(&req.tracked_id)?;
        let key = parse_key(&req.public_key_pem)?;
        let digest = crypto::identity_digest(
            &req.tracked_id,
            req.request_timestamp,
            UNREGISTER_TRACKED_ID_TAG,
        );
        check_signature(&key, &digest, &req.identity_signature)?;

        let fingerprint = crypto::fingerprint(&key);
        if self
            .storage
            .unregister_tracked_ids(&req.tracked_id, &fingerprint)
            .await?
        {
            log::info!(
                "[Registration] {} stopped tracking {}",
                fingerprint.short(),
                req.tracked_id.short()
            );
        }
        Ok(())
    }

    /// Reject requests older than the freshness window.
    ///
    /// Timestamps ahead of the local clock are accepted.
    fn check_fresh(&self, request_timestamp: i64) -> Result<(), RegistrationError> {
        let age = unix_nanos(self.clock.now()).saturating_sub(request_timestamp);
        let window = i64::try_from(REQUEST_FRESHNESS_WINDOW.as_nanos()).unwrap_or(i64::MAX);
        if age > window {
            log::debug!("[Registration] Rejecting request {}ms old", age / 1_000_000);
            return Err(RegistrationError::StaleRequest);
        }
        Ok(())
    }

    fn check_approval(
        &self,
        public_key_pem: &str,
        registration_timestamp: i64,
        registrar_signature: &str,
    ) -> Result<(), RegistrationError> {
        let Some(authority) = self.authorities.trusted_key(&self.authority_id) else {
            log::warn!(
                "[Registration] No key for authority '{}', rejecting registration",
                self.authority_id
            );
            return Err(RegistrationError::UntrustedKey);
        };
        // Any approval that does not verify, including an undecodable one,
        // means the key was never permissioned.
        let digest = crypto::registrar_digest(registration_timestamp, public_key_pem);
        crypto::verify_digest(&authority, &digest, registrar_signature).map_err(|e| {
            log::debug!("[Registration] Registrar approval rejected: {e}");
            RegistrationError::UntrustedKey
        })
    }
}

fn parse_key(public_key_pem: &str) -> Result<VerifyingKey, RegistrationError> {
    crypto::parse_public_key_pem(public_key_pem)
        .map_err(|e| RegistrationError::MalformedRequest(e.to_string()))
}

fn check_signature(
    key: &VerifyingKey,
    digest: &[u8; 32],
    signature: &str,
) -> Result<(), RegistrationError> {
    match crypto::verify_digest(key, digest, signature) {
        Ok(()) => Ok(()),
        Err(CryptoError::MalformedSignature(msg)) => Err(RegistrationError::MalformedRequest(
            format!("signature: {msg}"),
        )),
        Err(_) => Err(RegistrationError::BadSignature),
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), RegistrationError> {
    if value.is_empty() {
        return Err(RegistrationError::MalformedRequest(format!("{field} is empty")));
    }
    Ok(())
}

fn require_non_empty_id(id: &IntermediaryId) -> Result<(), RegistrationError> {
    if id.is_empty() {
        return Err(RegistrationError::MalformedRequest(
            "tracked id is empty".to_string(),
        ));
    }
    Ok(())
}

fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map_or(token.len(), |(i, _)| i);
    &token[..end]
}
