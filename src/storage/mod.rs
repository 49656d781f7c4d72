//! Durable state for users, tracked identities and ephemeral epoch records.
//!
//! Storage is pure data access. Policy (signature checks, epoch arithmetic,
//! dispatch decisions) lives in the callers; every method here is a single
//! atomic operation so concurrent callers always observe one of the valid
//! serializations.
//!
//! # Tables
//!
//! ```text
//! users       fingerprint        → User
//! identities  intermediary id    → TrackedIdentity (owners: set of fingerprints)
//! ephemerals  (iid, offset)      → EphemeralRecord
//! ```
//!
//! Deleting a user removes it from every identity's owner set; an identity
//! with no owners left is removed together with its ephemeral records.

pub mod memory;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use types::{
    EphemeralId, EphemeralKey, EphemeralRecord, Fingerprint, IntermediaryId, TrackedIdentity,
    User,
};

/// Shared storage handle.
pub type SharedStorage = Arc<dyn Storage>;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// A lock guarding the tables was poisoned by a panicking writer.
    Poisoned,
    /// The requested row does not exist.
    NotFound(String),
    /// An insert-only write hit an existing row.
    AlreadyExists(String),
    /// Snapshot file I/O failed.
    Io(std::io::Error),
    /// Snapshot (de)serialization failed.
    Serde(serde_json::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poisoned => write!(f, "storage lock poisoned"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Serde(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}

/// Data access contract shared by registration, the epoch manager and dispatch.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new user. Fails with `AlreadyExists` if the fingerprint is taken.
    async fn add_user(&self, user: User) -> Result<(), StorageError>;

    /// Insert or replace a user keyed by fingerprint.
    async fn upsert_user(&self, user: User) -> Result<(), StorageError>;

    /// Look up a user by fingerprint.
    async fn get_user(&self, fingerprint: &Fingerprint) -> Result<Option<User>, StorageError>;

    /// Delete a user and drop it from every identity it tracks.
    ///
    /// Returns whether a user was removed.
    async fn delete_user(&self, fingerprint: &Fingerprint) -> Result<bool, StorageError>;

    /// Register a device token, replacing any previous token for the key.
    ///
    /// Returns the token that was replaced, if any.
    async fn register_token(&self, user: User) -> Result<Option<String>, StorageError>;

    /// Remove the user owning `fingerprint` if its stored token is `token`.
    ///
    /// Returns whether a user was removed. A missing user or a different
    /// stored token is not an error.
    async fn unregister_token(
        &self,
        token: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StorageError>;

    /// Add `owner` to the tracked identity, creating it if needed.
    ///
    /// `offset` and `address_space_size` are only recorded when the identity
    /// is created; later registrations never rewrite them.
    async fn register_tracked_id(
        &self,
        intermediary_id: &IntermediaryId,
        owner: &Fingerprint,
        offset: i64,
        address_space_size: u8,
        at: DateTime<Utc>,
    ) -> Result<TrackedIdentity, StorageError>;

    /// Remove `owner` from the tracked identity.
    ///
    /// The identity and its ephemeral records go away with the last owner.
    /// Returns whether the owner was tracking it.
    async fn unregister_tracked_ids(
        &self,
        intermediary_id: &IntermediaryId,
        owner: &Fingerprint,
    ) -> Result<bool, StorageError>;

    /// Look up a tracked identity.
    async fn get_tracked_identity(
        &self,
        intermediary_id: &IntermediaryId,
    ) -> Result<Option<TrackedIdentity>, StorageError>;

    /// Insert the record for `(intermediary_id, offset)` unless one exists.
    ///
    /// Returns the record that is stored afterwards, which is the existing
    /// one when two writers race on the same key. Fails with `NotFound` if
    /// the identity is no longer tracked.
    async fn add_latest_ephemeral(
        &self,
        record: EphemeralRecord,
    ) -> Result<EphemeralRecord, StorageError>;

    /// Live records carrying `ephemeral_id`. Fails with `NotFound` when none
    /// are live at `now`.
    async fn get_ephemeral(
        &self,
        ephemeral_id: EphemeralId,
        now: DateTime<Utc>,
    ) -> Result<Vec<EphemeralRecord>, StorageError>;

    /// Newest live record for an identity.
    async fn get_latest_ephemeral(
        &self,
        intermediary_id: &IntermediaryId,
        now: DateTime<Utc>,
    ) -> Result<Option<EphemeralRecord>, StorageError>;

    /// Tracked identities that have no record for `offset`.
    async fn identities_missing_epoch(
        &self,
        offset: i64,
    ) -> Result<Vec<TrackedIdentity>, StorageError>;

    /// Keys of records whose stored expiry is at or before `now`.
    async fn expired_ephemerals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EphemeralKey>, StorageError>;

    /// Delete one record if it is expired at `now`.
    ///
    /// Returns whether a record was removed; a live record is left alone.
    async fn delete_ephemeral(
        &self,
        key: &EphemeralKey,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Users tracking any identity whose live record carries `ephemeral_id`.
    async fn users_for_ephemeral(
        &self,
        ephemeral_id: EphemeralId,
        now: DateTime<Utc>,
    ) -> Result<Vec<User>, StorageError>;
}
