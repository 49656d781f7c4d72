//! Configuration loading and persistence.
//!
//! Settings come from a JSON file (default `<config dir>/mixnotify/config.json`)
//! with `MIXNOTIFY_*` environment variables layered on top. Bearer
//! credentials (FCM access token, gateway API key) are read but never written
//! back to disk; the file itself is kept owner-only since it may hold the
//! VAPID private key.
//!
//! FCM authenticates with a service-account key file (`fcm_credentials_path`).
//! A raw `MIXNOTIFY_FCM_ACCESS_TOKEN` is accepted for short-lived setups; it
//! cannot be refreshed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, net::SocketAddr};

use crate::constants::{
    DEFAULT_ADDRESS_SPACE_SIZE, DEFAULT_AUTHORITY_ID, DEFAULT_CREATOR_INTERVAL,
    DEFAULT_DELETER_INTERVAL, DEFAULT_EPOCH_WINDOW, DEFAULT_NDF_REFRESH_INTERVAL,
    DEFAULT_POLL_DELAY, DEFAULT_POLL_TIMEOUT, DEFAULT_PROVIDER_TIMEOUT, DEFAULT_SNAPSHOT_INTERVAL,
    MAX_ADDRESS_SPACE_SIZE, MAX_EPOCH_WINDOW, NOTIFICATION_BODY, NOTIFICATION_TITLE,
};
use crate::notifications::Notification;
use crate::topology::NetworkParams;

/// Which push provider delivers notifications.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// FCM HTTP v1.
    Fcm,
    /// Browser Web Push with VAPID.
    WebPush,
    /// Log only.
    #[default]
    Log,
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fcm" => Ok(Self::Fcm),
            "web_push" => Ok(Self::WebPush),
            "log" => Ok(Self::Log),
            other => anyhow::bail!("Unknown push provider '{other}' (expected fcm, web_push or log)"),
        }
    }
}

/// Configuration for the mixnotify service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address the registration API listens on.
    pub listen_addr: String,
    /// Base URL of the gateway to poll.
    pub gateway_url: String,
    /// Bearer key for the gateway - NOT serialized to disk.
    #[serde(skip_serializing)]
    pub gateway_api_key: Option<String>,
    /// Pause between gateway polls, in milliseconds.
    pub poll_delay_ms: u64,
    /// Upper bound for one gateway poll, in seconds.
    pub poll_timeout_secs: u64,
    /// Upper bound for one provider call, in seconds.
    pub provider_timeout_secs: u64,
    /// Interval of the epoch creator pass, in seconds.
    pub creator_interval_secs: u64,
    /// Interval of the epoch deleter pass, in seconds.
    pub deleter_interval_secs: u64,
    /// Epoch window, in seconds, until the gateway publishes one.
    pub epoch_window_secs: u64,
    /// Interval between network definition refreshes, in seconds; 0 disables.
    pub ndf_refresh_secs: u64,
    /// Interval between state snapshot writes, in seconds.
    pub snapshot_interval_secs: u64,
    /// Significant bits of an ephemeral id, until the gateway publishes one.
    pub address_space_size: u8,
    /// Id of the permissioning authority whose approvals are trusted.
    pub authority_id: String,
    /// SPKI PEM file holding the authority's Ed25519 key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_key_path: Option<PathBuf>,
    /// Push provider.
    pub provider: ProviderKind,
    /// FCM project id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcm_project_id: Option<String>,
    /// Google service-account key file for FCM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcm_credentials_path: Option<PathBuf>,
    /// FCM OAuth access token - NOT serialized to disk.
    #[serde(skip_serializing)]
    pub fcm_access_token: Option<String>,
    /// VAPID public key (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vapid_public_key: Option<String>,
    /// VAPID private key (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vapid_private_key: Option<String>,
    /// VAPID `sub` claim.
    pub vapid_subject: String,
    /// Notification title.
    pub notification_title: String,
    /// Notification body.
    pub notification_body: String,
    /// Snapshot file for persisted state; state is memory-only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            gateway_url: "http://127.0.0.1:8090".to_string(),
            gateway_api_key: None,
            poll_delay_ms: DEFAULT_POLL_DELAY.as_millis() as u64,
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT.as_secs(),
            provider_timeout_secs: DEFAULT_PROVIDER_TIMEOUT.as_secs(),
            creator_interval_secs: DEFAULT_CREATOR_INTERVAL.as_secs(),
            deleter_interval_secs: DEFAULT_DELETER_INTERVAL.as_secs(),
            epoch_window_secs: DEFAULT_EPOCH_WINDOW.as_secs(),
            ndf_refresh_secs: DEFAULT_NDF_REFRESH_INTERVAL.as_secs(),
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL.as_secs(),
            address_space_size: DEFAULT_ADDRESS_SPACE_SIZE,
            authority_id: DEFAULT_AUTHORITY_ID.to_string(),
            authority_key_path: None,
            provider: ProviderKind::Log,
            fcm_project_id: None,
            fcm_credentials_path: None,
            fcm_access_token: None,
            vapid_public_key: None,
            vapid_private_key: None,
            vapid_subject: "mailto:admin@localhost".to_string(),
            notification_title: NOTIFICATION_TITLE.to_string(),
            notification_body: NOTIFICATION_BODY.to_string(),
            state_path: None,
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("mixnotify")
            .join("config.json"))
    }

    /// Load from `path` (or the default location), apply environment
    /// overrides and validate.
    ///
    /// An explicitly given file must exist; a missing default file means
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = Self::default_path()?;
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    log::info!("No config at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse one config file without overrides or validation.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply `MIXNOTIFY_*` overrides looked up through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(name: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    log::warn!("Ignoring {name}={value}: not a valid value");
                    None
                }
            }
        }

        if let Some(addr) = var("MIXNOTIFY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(url) = var("MIXNOTIFY_GATEWAY_URL") {
            self.gateway_url = url;
        }
        if let Some(key) = var("MIXNOTIFY_GATEWAY_API_KEY") {
            self.gateway_api_key = Some(key);
        }
        if let Some(ms) = parsed("MIXNOTIFY_POLL_DELAY_MS", var("MIXNOTIFY_POLL_DELAY_MS")) {
            self.poll_delay_ms = ms;
        }
        if let Some(secs) = parsed(
            "MIXNOTIFY_EPOCH_WINDOW_SECS",
            var("MIXNOTIFY_EPOCH_WINDOW_SECS"),
        ) {
            self.epoch_window_secs = secs;
        }
        if let Some(size) = parsed(
            "MIXNOTIFY_ADDRESS_SPACE_SIZE",
            var("MIXNOTIFY_ADDRESS_SPACE_SIZE"),
        ) {
            self.address_space_size = size;
        }
        if let Some(path) = var("MIXNOTIFY_STATE_PATH") {
            self.state_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("MIXNOTIFY_AUTHORITY_KEY") {
            self.authority_key_path = Some(PathBuf::from(path));
        }
        if let Some(kind) = parsed("MIXNOTIFY_PROVIDER", var("MIXNOTIFY_PROVIDER")) {
            self.provider = kind;
        }
        if let Some(path) = var("MIXNOTIFY_FCM_CREDENTIALS") {
            self.fcm_credentials_path = Some(PathBuf::from(path));
        }
        if let Some(token) = var("MIXNOTIFY_FCM_ACCESS_TOKEN") {
            self.fcm_access_token = Some(token);
        }
        if let Some(key) = var("MIXNOTIFY_VAPID_PRIVATE_KEY") {
            self.vapid_private_key = Some(key);
        }
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.listen_socket_addr()?;
        for (name, value) in [
            ("poll_delay_ms", self.poll_delay_ms),
            ("poll_timeout_secs", self.poll_timeout_secs),
            ("provider_timeout_secs", self.provider_timeout_secs),
            ("creator_interval_secs", self.creator_interval_secs),
            ("deleter_interval_secs", self.deleter_interval_secs),
            ("epoch_window_secs", self.epoch_window_secs),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
        ] {
            anyhow::ensure!(value > 0, "{name} must be greater than zero");
        }
        anyhow::ensure!(
            self.epoch_window_secs <= MAX_EPOCH_WINDOW.as_secs(),
            "epoch_window_secs must be at most {}, got {}",
            MAX_EPOCH_WINDOW.as_secs(),
            self.epoch_window_secs
        );
        anyhow::ensure!(
            (1..=MAX_ADDRESS_SPACE_SIZE).contains(&self.address_space_size),
            "address_space_size must be between 1 and {MAX_ADDRESS_SPACE_SIZE}, got {}",
            self.address_space_size
        );
        match self.provider {
            ProviderKind::Fcm => {
                anyhow::ensure!(
                    self.fcm_credentials_path.is_some()
                        || (self.fcm_project_id.is_some() && self.fcm_access_token.is_some()),
                    "fcm provider needs fcm_credentials_path (or fcm_project_id with MIXNOTIFY_FCM_ACCESS_TOKEN)"
                );
            }
            ProviderKind::WebPush => {
                anyhow::ensure!(
                    self.vapid_public_key.is_some() && self.vapid_private_key.is_some(),
                    "web_push provider needs VAPID keys (run `mixnotify vapid-keygen --save`)"
                );
            }
            ProviderKind::Log => {}
        }
        Ok(())
    }

    /// Persist to `path` with owner-only permissions. Secrets are skipped.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("Invalid listen_addr '{}'", self.listen_addr))
    }

    /// Pause between gateway polls.
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    /// Gateway poll timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Provider call timeout.
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Creator pass interval.
    pub fn creator_interval(&self) -> Duration {
        Duration::from_secs(self.creator_interval_secs)
    }

    /// Deleter pass interval.
    pub fn deleter_interval(&self) -> Duration {
        Duration::from_secs(self.deleter_interval_secs)
    }

    /// Network definition refresh interval, if refreshing is enabled.
    pub fn ndf_refresh_interval(&self) -> Option<Duration> {
        (self.ndf_refresh_secs > 0).then(|| Duration::from_secs(self.ndf_refresh_secs))
    }

    /// Snapshot write interval.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    /// Initial network parameters.
    pub fn network_params(&self) -> NetworkParams {
        NetworkParams {
            epoch_window: Duration::from_secs(self.epoch_window_secs),
            address_space_size: self.address_space_size,
        }
    }

    /// Notification sent to devices.
    pub fn notification(&self) -> Notification {
        Notification {
            title: self.notification_title.clone(),
            body: self.notification_body.clone(),
        }
    }
}
