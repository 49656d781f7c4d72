//! Push notification delivery.
//!
//! The dispatch loop hands every resolved device token to a
//! [`PushProvider`]. Providers only have to tell two kinds of failure apart:
//! a token the provider will never accept again ([`PushError::InvalidToken`],
//! which unregisters the device) and everything else.
//!
//! # Providers
//!
//! ```text
//! fcm       FCM HTTP v1 (Android / iOS apps)
//! web_push  RFC 8030 web push with VAPID (RFC 8292) and RFC 8291 encryption
//! log       logs instead of sending; for deployments without credentials
//! ```
//!
//! The notification payload is fixed. It never carries message content,
//! only a hint that something is waiting.

pub mod fcm;
pub mod oauth;
pub mod vapid;
pub mod web_push;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constants::{NOTIFICATION_BODY, NOTIFICATION_TITLE};

pub use fcm::FcmProvider;
pub use oauth::{AccessTokenSource, ServiceAccountKey, ServiceAccountTokens, StaticToken};
pub use vapid::VapidKeys;
pub use web_push::WebPushProvider;

/// Shared provider handle.
pub type SharedPushProvider = Arc<dyn PushProvider>;

/// The user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub body: String,
}

impl Default for Notification {
    fn default() -> Self {
        Self {
            title: NOTIFICATION_TITLE.to_string(),
            body: NOTIFICATION_BODY.to_string(),
        }
    }
}

/// Delivery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The provider rejected the token permanently.
    InvalidToken(String),
    /// Any other failure (transport, auth, quota, timeout).
    Other(String),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken(msg) => write!(f, "Invalid push token: {msg}"),
            Self::Other(msg) => write!(f, "Push delivery failed: {msg}"),
        }
    }
}

impl std::error::Error for PushError {}

/// Delivers one notification to one device.
#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Send `notification` to `token`, returning the provider's message id.
    async fn send(&self, token: &str, notification: &Notification) -> Result<String, PushError>;
}

/// Provider that only logs what it would have sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProvider;

#[async_trait]
impl PushProvider for LogProvider {
    async fn send(&self, token: &str, notification: &Notification) -> Result<String, PushError> {
        let prefix: String = token.chars().take(8).collect();
        log::info!(
            "[LogPush] Would notify {prefix}...: {} / {}",
            notification.title,
            notification.body
        );
        Ok(format!("log:{prefix}"))
    }
}
