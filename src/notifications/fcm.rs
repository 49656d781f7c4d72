//! FCM HTTP v1 provider.
//!
//! Posts `{"message": {"token", "notification": {"title", "body"}}}` to the
//! project's `messages:send` endpoint with a bearer access token and
//! returns the message name FCM assigns.
//!
//! A 401 means the access token expired or was revoked: the token source is
//! invalidated and the send retried once with a fresh token.
//!
//! FCM answers 404 (`UNREGISTERED`) for tokens of uninstalled apps and 403
//! (`SENDER_ID_MISMATCH`) for tokens that belong to another project. Both
//! mean the stored token is useless, so they map to
//! [`PushError::InvalidToken`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::oauth::SharedAccessTokenSource;
use super::{Notification, PushError, PushProvider};

/// Default FCM API base.
pub const FCM_API_BASE: &str = "https://fcm.googleapis.com";

#[derive(Serialize)]
struct SendRequest<'a> {
    message: Message<'a>,
}

#[derive(Serialize)]
struct Message<'a> {
    token: &'a str,
    notification: &'a Notification,
}

#[derive(Deserialize)]
struct SendResponse {
    name: String,
}

/// Sends notifications through FCM.
#[derive(Clone)]
pub struct FcmProvider {
    client: reqwest::Client,
    send_url: String,
    tokens: SharedAccessTokenSource,
}

impl std::fmt::Debug for FcmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcmProvider")
            .field("send_url", &self.send_url)
            .finish_non_exhaustive()
    }
}

impl FcmProvider {
    /// Provider for `project_id` against the public FCM API.
    pub fn new(client: reqwest::Client, project_id: &str, tokens: SharedAccessTokenSource) -> Self {
        Self::with_base_url(client, FCM_API_BASE, project_id, tokens)
    }

    /// Provider against a custom API base (emulators, tests).
    pub fn with_base_url(
        client: reqwest::Client,
        base_url: &str,
        project_id: &str,
        tokens: SharedAccessTokenSource,
    ) -> Self {
        Self {
            client,
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                base_url.trim_end_matches('/'),
                project_id
            ),
            tokens,
        }
    }

    async fn post(
        &self,
        token: &str,
        notification: &Notification,
    ) -> Result<reqwest::Response, PushError> {
        let access_token = self.tokens.access_token().await?;
        self.client
            .post(&self.send_url)
            .bearer_auth(access_token)
            .json(&SendRequest {
                message: Message {
                    token,
                    notification,
                },
            })
            .send()
            .await
            .map_err(|e| PushError::Other(format!("FCM request failed: {e}")))
    }
}

#[async_trait]
impl PushProvider for FcmProvider {
    async fn send(&self, token: &str, notification: &Notification) -> Result<String, PushError> {
        let mut response = self.post(token, notification).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            log::info!("[FCM] Access token rejected, refreshing");
            self.tokens.invalidate().await;
            response = self.post(token, notification).await?;
        }

        let status = response.status().as_u16();
        match status {
            200..=299 => {
                let body: SendResponse = response
                    .json()
                    .await
                    .map_err(|e| PushError::Other(format!("Undecodable FCM response: {e}")))?;
                Ok(body.name)
            }
            403 | 404 => {
                let body = response.text().await.unwrap_or_default();
                log::info!("[FCM] Token rejected (HTTP {status})");
                Err(PushError::InvalidToken(format!("HTTP {status}: {body}")))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(PushError::Other(format!("FCM send failed (HTTP {status}): {body}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::oauth::{AccessTokenSource, StaticToken};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn provider(server: &MockServer) -> FcmProvider {
        FcmProvider::with_base_url(
            reqwest::Client::new(),
            &server.uri(),
            "demo",
            Arc::new(StaticToken::new("secret")),
        )
    }

    /// Hands out "stale" until invalidated, then "fresh".
    #[derive(Default)]
    struct RotatingTokens {
        invalidations: AtomicUsize,
    }

    #[async_trait]
    impl AccessTokenSource for RotatingTokens {
        async fn access_token(&self) -> Result<String, PushError> {
            Ok(if self.invalidations.load(Ordering::SeqCst) == 0 {
                "stale".to_string()
            } else {
                "fresh".to_string()
            })
        }

        async fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_expired_access_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "projects/demo/messages/2"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tokens = Arc::new(RotatingTokens::default());
        let provider = FcmProvider::with_base_url(
            reqwest::Client::new(),
            &server.uri(),
            "demo",
            Arc::clone(&tokens) as SharedAccessTokenSource,
        );
        let id = provider
            .send("tok", &Notification::default())
            .await
            .expect("send after refresh");
        assert_eq!(id, "projects/demo/messages/2");
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeated_unauthorized_is_other() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let result = provider(&server)
            .await
            .send("tok", &Notification::default())
            .await;
        assert!(matches!(result, Err(PushError::Other(_))));
    }

    #[tokio::test]
    async fn test_send_returns_message_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/demo/messages:send"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "message": {"token": "tok", "notification": {"title": "t", "body": "b"}}
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "projects/demo/messages/1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let notification = Notification {
            title: "t".to_string(),
            body: "b".to_string(),
        };
        let id = provider(&server)
            .await
            .send("tok", &notification)
            .await
            .expect("send");
        assert_eq!(id, "projects/demo/messages/1");
    }

    #[tokio::test]
    async fn test_unregistered_token_is_invalid() {
        for status in [403, 404] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let result = provider(&server)
                .await
                .send("tok", &Notification::default())
                .await;
            assert!(matches!(result, Err(PushError::InvalidToken(_))), "HTTP {status}");
        }
    }

    #[tokio::test]
    async fn test_server_error_is_other() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = provider(&server)
            .await
            .send("tok", &Notification::default())
            .await;
        assert!(matches!(result, Err(PushError::Other(_))));
    }
}
