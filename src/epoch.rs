//! Ephemeral identity epoch manager.
//!
//! Keeps exactly one live [`EphemeralRecord`] per tracked identity for the
//! current epoch and removes records once their stored expiry has passed.
//!
//! # Lifecycle of a tracked identity
//!
//! ```text
//! no record ──creator──▶ current epoch valid ──expiry──▶ expired ──deleter──▶ no record
//! ```
//!
//! # Passes
//!
//! - **Creator**: for every identity without a record at the current offset,
//!   derive the ephemeral id and insert the record. Also run once right after
//!   a tracked-id registration (see [`EpochManager::create_for`]).
//! - **Deleter**: delete every record whose stored `expires_at` has passed.
//!   Expiry is never recomputed from epoch arithmetic, so a skewed clock on
//!   another instance cannot shorten a record's life.
//!
//! A failure on one record is logged and the pass continues. Passes are
//! idempotent and rerun in full on every tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::storage::{EphemeralRecord, SharedStorage, StorageError, TrackedIdentity};
use crate::topology::{derive_ephemeral_id, EpochSnapshot, SharedTopologySource};

/// Outcome of one creator pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CreatorReport {
    /// Epoch offset the pass worked on.
    pub offset: i64,
    /// Records inserted (or found already inserted by a racing writer).
    pub created: usize,
    /// Identities whose record could not be written.
    pub failed: usize,
}

/// Outcome of one deleter pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeleterReport {
    /// Records removed.
    pub deleted: usize,
    /// Records that could not be removed.
    pub failed: usize,
}

/// Creates and retires ephemeral epoch records.
pub struct EpochManager {
    storage: SharedStorage,
    topology: SharedTopologySource,
    clock: SharedClock,
}

impl std::fmt::Debug for EpochManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochManager")
            .field("params", &self.topology.current())
            .finish_non_exhaustive()
    }
}

impl EpochManager {
    /// Create a manager over `storage`.
    pub fn new(storage: SharedStorage, topology: SharedTopologySource, clock: SharedClock) -> Self {
        Self {
            storage,
            topology,
            clock,
        }
    }

    /// Freeze the current epoch state.
    pub fn snapshot(&self) -> EpochSnapshot {
        EpochSnapshot::take(self.clock.now(), self.topology.current())
    }

    /// Ensure `identity` has a record for the snapshot's epoch.
    ///
    /// Safe to race with the creator pass: storage keeps the first record
    /// written for `(identity, offset)` and both callers get it back.
    pub async fn create_for(
        &self,
        identity: &TrackedIdentity,
        snapshot: &EpochSnapshot,
    ) -> Result<EphemeralRecord, StorageError> {
        let created_at = self.clock.now();
        let record = EphemeralRecord {
            intermediary_id: identity.intermediary_id.clone(),
            ephemeral_id: derive_ephemeral_id(
                &identity.intermediary_id,
                snapshot.offset,
                snapshot.address_space_size,
            ),
            offset: snapshot.offset,
            address_space_size: snapshot.address_space_size,
            created_at,
            expires_at: snapshot.expiry_for(created_at),
        };
        self.storage.add_latest_ephemeral(record).await
    }

    /// Run one creator pass over every tracked identity.
    ///
    /// Only a failure to enumerate identities fails the pass; per-identity
    /// write failures are counted and logged.
    pub async fn run_creator_pass(&self) -> Result<CreatorReport, StorageError> {
        let snapshot = self.snapshot();
        let pending = self.storage.identities_missing_epoch(snapshot.offset).await?;

        let mut report = CreatorReport {
            offset: snapshot.offset,
            ..CreatorReport::default()
        };

        for identity in &pending {
            match self.create_for(identity, &snapshot).await {
                Ok(_) => report.created += 1,
                // Unregistered between enumeration and insert.
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    report.failed += 1;
                    log::warn!(
                        "[Epoch] Failed to create record for {} at offset {}: {e}",
                        identity.intermediary_id.short(),
                        snapshot.offset
                    );
                }
            }
        }

        Ok(report)
    }

    /// Run one deleter pass, removing every expired record.
    pub async fn run_deleter_pass(&self) -> Result<DeleterReport, StorageError> {
        let now = self.clock.now();
        let expired = self.storage.expired_ephemerals(now).await?;

        let mut report = DeleterReport::default();
        for key in &expired {
            match self.storage.delete_ephemeral(key, now).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    log::warn!(
                        "[Epoch] Failed to delete record {} at offset {}: {e}",
                        key.intermediary_id.short(),
                        key.offset
                    );
                }
            }
        }

        Ok(report)
    }

    /// Run the creator pass every `interval` until `cancel` fires.
    ///
    /// The first pass runs immediately. A pass that outlasts the interval
    /// delays the next tick instead of overlapping it.
    pub fn spawn_creator(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("[Epoch] Creator started (every {interval:?})");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.run_creator_pass().await {
                    Ok(report) if report.failed > 0 => log::warn!(
                        "[Epoch] Creator pass at offset {}: {} created, {} failed",
                        report.offset,
                        report.created,
                        report.failed
                    ),
                    Ok(report) => log::debug!(
                        "[Epoch] Creator pass at offset {}: {} created",
                        report.offset,
                        report.created
                    ),
                    Err(e) => log::error!("[Epoch] Creator pass failed: {e}"),
                }
            }

            log::info!("[Epoch] Creator stopped");
        })
    }

    /// Run the deleter pass every `interval` until `cancel` fires.
    pub fn spawn_deleter(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("[Epoch] Deleter started (every {interval:?})");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.run_deleter_pass().await {
                    Ok(report) if report.failed > 0 => log::warn!(
                        "[Epoch] Deleter pass: {} deleted, {} failed",
                        report.deleted,
                        report.failed
                    ),
                    Ok(report) => log::debug!("[Epoch] Deleter pass: {} deleted", report.deleted),
                    Err(e) => log::error!("[Epoch] Deleter pass failed: {e}"),
                }
            }

            log::info!("[Epoch] Deleter stopped");
        })
    }
}
