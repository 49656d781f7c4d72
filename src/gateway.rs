//! Gateway polling.
//!
//! The gateway knows which identities have messages waiting but not who
//! they belong to. The dispatch loop asks it for that list through
//! [`GatewayClient`]. The gateway also publishes the network definition
//! (NDF) carrying the current address-space size, read through
//! [`NdfSource`]. [`HttpGateway`] implements both.
//!
//! # Wire format
//!
//! ```text
//! GET {base}/notifications        (Authorization: Bearer {api_key} if configured)
//! 200 {"ids": ["4711", "9f86d081884c7d65..."]}
//!
//! GET {base}/ndf
//! 200 {"address_space": [{"size": 16}], "epoch_window_secs": 86400}
//! ```
//!
//! `epoch_window_secs` is optional; without it the configured window stays.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Shared gateway handle.
pub type SharedGateway = Arc<dyn GatewayClient>;

/// Shared network definition source.
pub type SharedNdfSource = Arc<dyn NdfSource>;

/// Failure talking to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The gateway could not be reached.
    Transport(String),
    /// The gateway answered with a non-success status.
    Status(u16),
    /// The response body was not the expected JSON.
    Decode(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Failed to connect to gateway: {msg}"),
            Self::Status(status) => write!(f, "Gateway returned HTTP {status}"),
            Self::Decode(msg) => write!(f, "Failed to parse gateway response: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Source of identities with pending messages.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Identities that have messages waiting since the last poll.
    async fn poll_pending(&self) -> Result<Vec<String>, GatewayError>;
}

/// One address space entry of the network definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AddressSpace {
    /// Significant bits of an ephemeral id.
    pub size: u8,
}

/// The parts of the gateway's network definition this service uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkDefinition {
    /// Address spaces; the first entry is the one in effect.
    pub address_space: Vec<AddressSpace>,
    /// Epoch window, when the network publishes one.
    #[serde(default)]
    pub epoch_window_secs: Option<u64>,
}

/// Source of the network definition.
#[async_trait]
pub trait NdfSource: Send + Sync {
    /// The network definition currently published.
    async fn fetch_ndf(&self) -> Result<NetworkDefinition, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct PendingResponse {
    ids: Vec<String>,
}

/// Talks to a gateway over HTTP.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGateway {
    /// Gateway rooted at `base_url`.
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, route: &str) -> Result<T, GatewayError> {
        let mut request = self.client.get(format!("{}/{route}", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Status(response.status().as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl NdfSource for HttpGateway {
    async fn fetch_ndf(&self) -> Result<NetworkDefinition, GatewayError> {
        self.get_json("ndf").await
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn poll_pending(&self) -> Result<Vec<String>, GatewayError> {
        let body: PendingResponse = self.get_json("notifications").await?;

        if !body.ids.is_empty() {
            log::debug!("[Gateway] Polled {} pending identities", body.ids.len());
        }
        Ok(body.ids)
    }
}
