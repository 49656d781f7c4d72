//! Web Push provider (RFC 8030).
//!
//! For web clients the registered device token is the browser's push
//! subscription serialized as JSON (`endpoint`, `p256dh`, `auth`). Payloads
//! are encrypted with RFC 8291 and signed with VAPID (RFC 8292) by the
//! `web-push` crate; the HTTP request itself goes out through reqwest so
//! the connection pool is shared with the rest of the service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Notification, PushError, PushProvider, VapidKeys};
use crate::constants::WEB_PUSH_TTL_SECS;

/// A browser push subscription, as registered in the token field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    /// Push service endpoint URL.
    pub endpoint: String,
    /// Browser's P-256 ECDH public key (base64url).
    pub p256dh: String,
    /// Shared auth secret (base64url).
    pub auth: String,
}

impl PushSubscription {
    /// Parse a device token. The endpoint must be an absolute `http(s)` URL.
    pub fn from_token(token: &str) -> Result<Self, PushError> {
        let subscription: Self = serde_json::from_str(token)
            .map_err(|e| PushError::InvalidToken(format!("not a push subscription: {e}")))?;

        let endpoint = reqwest::Url::parse(&subscription.endpoint)
            .map_err(|e| PushError::InvalidToken(format!("bad push endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "https" | "http") || endpoint.host_str().is_none() {
            return Err(PushError::InvalidToken(format!(
                "bad push endpoint: {}",
                subscription.endpoint
            )));
        }

        Ok(subscription)
    }
}

/// Sends notifications to browser push services.
#[derive(Debug, Clone)]
pub struct WebPushProvider {
    client: reqwest::Client,
    vapid: VapidKeys,
    subject: String,
}

impl WebPushProvider {
    /// Create a provider signing with `vapid`. `subject` is the VAPID `sub`
    /// claim, a `mailto:` or `https:` contact for the push service operator.
    pub fn new(client: reqwest::Client, vapid: VapidKeys, subject: impl Into<String>) -> Self {
        Self {
            client,
            vapid,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl PushProvider for WebPushProvider {
    async fn send(&self, token: &str, notification: &Notification) -> Result<String, PushError> {
        use web_push::{
            ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushMessageBuilder,
        };

        let subscription = PushSubscription::from_token(token)?;
        let sub_info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.p256dh,
            &subscription.auth,
        );

        let mut sig_builder =
            VapidSignatureBuilder::from_base64(self.vapid.private_key_base64url(), &sub_info)
                .map_err(|e| PushError::Other(format!("Failed to build VAPID signature: {e}")))?;
        sig_builder.add_claim("sub", self.subject.as_str());
        // The JWT audience comes from the subscription endpoint.
        let sig = sig_builder
            .build()
            .map_err(|e| PushError::InvalidToken(format!("Failed to sign VAPID JWT: {e}")))?;

        let payload = serde_json::to_vec(notification)
            .map_err(|e| PushError::Other(format!("Failed to encode notification: {e}")))?;

        let mut builder = WebPushMessageBuilder::new(&sub_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, &payload);
        builder.set_vapid_signature(sig);
        builder.set_ttl(WEB_PUSH_TTL_SECS);

        // Bad p256dh/auth values surface here; the subscription can never work.
        let message = builder
            .build()
            .map_err(|e| PushError::InvalidToken(format!("Unusable subscription: {e}")))?;

        let mut request = self
            .client
            .post(message.endpoint.to_string())
            .header("TTL", message.ttl.to_string());

        if let Some(urgency) = message.urgency {
            request = request.header("Urgency", urgency.to_string());
        }

        if let Some(topic) = message.topic {
            request = request.header("Topic", topic);
        }

        if let Some(push_payload) = message.payload {
            request = request
                .header("Content-Encoding", push_payload.content_encoding.to_str())
                .header("Content-Type", "application/octet-stream");

            for (key, value) in &push_payload.crypto_headers {
                request = request.header(*key, value.as_str());
            }

            request = request.body(push_payload.content);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PushError::Other(format!("Web push HTTP request failed: {e}")))?;
        let status = response.status().as_u16();

        match status {
            200..=299 => Ok(response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()),
            404 | 410 => {
                log::info!("[WebPush] Subscription expired (HTTP {status})");
                Err(PushError::InvalidToken(format!("HTTP {status}")))
            }
            429 => {
                log::warn!("[WebPush] Rate limited (429), dropping notification");
                Ok(String::new())
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(PushError::Other(format!(
                    "Web push send failed (HTTP {status}): {body}"
                )))
            }
        }
    }
}
