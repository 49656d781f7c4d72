//! Network-wide epoch parameters and ephemeral id derivation.
//!
//! The epoch window and the address-space size are decided by the network,
//! not by this service. Every pass of the epoch manager (and every tracked-id
//! registration) takes one immutable [`EpochSnapshot`] from the current
//! [`NetworkParams`] and works against that snapshot only, so a parameter
//! change mid-pass cannot mix two epochs.
//!
//! [`SharedTopology::spawn_refresher`] keeps the parameters in step with the
//! network definition the gateway publishes.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::constants::{MAX_ADDRESS_SPACE_SIZE, MAX_EPOCH_WINDOW};
use crate::gateway::{GatewayError, NdfSource, NetworkDefinition, SharedNdfSource};
use crate::storage::{EphemeralId, IntermediaryId};

/// Epoch parameters published by the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParams {
    /// Width of one epoch; also the lifetime of an ephemeral record.
    pub epoch_window: Duration,
    /// Number of significant low-order bits of an ephemeral id.
    pub address_space_size: u8,
}

impl NetworkParams {
    /// These parameters with `ndf` applied. Fields the definition leaves
    /// out keep their current value.
    pub fn merged_with(self, ndf: &NetworkDefinition) -> Result<Self, GatewayError> {
        let size = ndf
            .address_space
            .first()
            .ok_or_else(|| GatewayError::Decode("network definition has no address space".into()))?
            .size;
        if !(1..=MAX_ADDRESS_SPACE_SIZE).contains(&size) {
            return Err(GatewayError::Decode(format!(
                "address space size {size} outside 1..={MAX_ADDRESS_SPACE_SIZE}"
            )));
        }

        let epoch_window = match ndf.epoch_window_secs {
            None => self.epoch_window,
            Some(secs) => {
                let window = Duration::from_secs(secs);
                if secs == 0 || window > MAX_EPOCH_WINDOW {
                    return Err(GatewayError::Decode(format!(
                        "epoch window {secs}s outside 1..={}s",
                        MAX_EPOCH_WINDOW.as_secs()
                    )));
                }
                window
            }
        };

        Ok(Self {
            epoch_window,
            address_space_size: size,
        })
    }
}

/// Read-only source of the current [`NetworkParams`].
pub trait TopologySource: Send + Sync {
    /// Parameters in effect right now.
    fn current(&self) -> NetworkParams;
}

/// Shared topology handle.
pub type SharedTopologySource = Arc<dyn TopologySource>;

/// Topology parameters that can be replaced at runtime.
#[derive(Debug)]
pub struct SharedTopology {
    params: RwLock<NetworkParams>,
}

impl SharedTopology {
    /// Start from `params`.
    pub fn new(params: NetworkParams) -> Self {
        Self {
            params: RwLock::new(params),
        }
    }

    /// Replace the parameters. Records created earlier keep the values they
    /// were created with.
    pub fn update(&self, params: NetworkParams) {
        let mut current = self
            .params
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *current != params {
            log::info!(
                "[Topology] Network params changed: window {:?} → {:?}, address space {} → {}",
                current.epoch_window,
                params.epoch_window,
                current.address_space_size,
                params.address_space_size
            );
        }
        *current = params;
    }

    /// Fetch the network definition once and apply it.
    pub async fn refresh(&self, source: &dyn NdfSource) -> Result<NetworkParams, GatewayError> {
        let ndf = source.fetch_ndf().await?;
        let params = self.current().merged_with(&ndf)?;
        self.update(params);
        Ok(params)
    }

    /// Refresh from `source` every `interval` until `cancel` fires. Failed
    /// refreshes keep the last known parameters.
    pub fn spawn_refresher(
        self: Arc<Self>,
        source: SharedNdfSource,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("[Topology] NDF refresher started (every {interval:?})");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = self.refresh(source.as_ref()).await {
                    log::warn!("[Topology] NDF refresh failed, keeping current params: {e}");
                }
            }

            log::info!("[Topology] NDF refresher stopped");
        })
    }
}

impl TopologySource for SharedTopology {
    fn current(&self) -> NetworkParams {
        *self
            .params
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Epoch state frozen for the duration of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Index of the current epoch window.
    pub offset: i64,
    /// Window width.
    pub window: chrono::Duration,
    /// Address-space size for records created under this snapshot.
    pub address_space_size: u8,
}

impl EpochSnapshot {
    /// Quantize `now` under `params`. The window is clamped to
    /// `1s..=MAX_EPOCH_WINDOW`.
    pub fn take(now: DateTime<Utc>, params: NetworkParams) -> Self {
        let window = chrono::Duration::from_std(params.epoch_window.min(MAX_EPOCH_WINDOW))
            .unwrap_or(chrono::Duration::seconds(1))
            .max(chrono::Duration::seconds(1));
        Self {
            taken_at: now,
            offset: epoch_offset(now, window),
            window,
            address_space_size: params.address_space_size,
        }
    }

    /// Expiry of a record created at `created_at` under this snapshot.
    pub fn expiry_for(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Index of the window containing `now`: `floor(unix_time / window)`.
pub fn epoch_offset(now: DateTime<Utc>, window: chrono::Duration) -> i64 {
    let window_secs = window.num_seconds().max(1);
    now.timestamp().div_euclid(window_secs)
}

/// Derive the ephemeral id of `intermediary_id` for epoch `offset`.
///
/// First 8 bytes of `SHA-256(iid ‖ offset_be ‖ size)` as a big-endian
/// `u64`, keeping only the low `address_space_size` bits.
pub fn derive_ephemeral_id(
    intermediary_id: &IntermediaryId,
    offset: i64,
    address_space_size: u8,
) -> EphemeralId {
    let size = address_space_size.clamp(1, MAX_ADDRESS_SPACE_SIZE);

    let mut hasher = Sha256::new();
    hasher.update(intermediary_id.as_bytes());
    hasher.update(offset.to_be_bytes());
    hasher.update([size]);
    let hash = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    let raw = u64::from_be_bytes(prefix);

    let mask = if size >= 64 { u64::MAX } else { (1u64 << size) - 1 };
    EphemeralId((raw & mask) as i64)
}
