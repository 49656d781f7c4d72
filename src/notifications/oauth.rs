//! OAuth access tokens for FCM.
//!
//! FCM HTTP v1 wants a short-lived Google OAuth bearer token. Deployments
//! hand the service a service-account JSON key; [`ServiceAccountTokens`]
//! signs an RS256 assertion with the key, trades it for an access token at
//! the key's `token_uri` and caches the token until shortly before it
//! expires.
//!
//! ```text
//! POST {token_uri}
//!   grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer
//!   assertion=<header>.<claims>.<RS256 signature>
//! 200 {"access_token": "...", "expires_in": 3599, "token_type": "Bearer"}
//! ```
//!
//! [`StaticToken`] wraps a token obtained elsewhere; it cannot refresh.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine};
use chrono::{DateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::PushError;
use crate::clock::SharedClock;
use crate::constants::{
    ACCESS_TOKEN_REFRESH_MARGIN, FCM_OAUTH_SCOPE, GOOGLE_TOKEN_URI, OAUTH_ASSERTION_LIFETIME,
};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Shared token source handle.
pub type SharedAccessTokenSource = Arc<dyn AccessTokenSource>;

/// Supplies bearer tokens for provider requests.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// A token believed to be valid right now.
    async fn access_token(&self) -> Result<String, PushError>;

    /// Forget the cached token; the provider rejected it.
    async fn invalidate(&self);
}

/// A fixed token. Stops working when the token expires.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, PushError> {
        Ok(self.0.clone())
    }

    async fn invalidate(&self) {
        log::warn!("[OAuth] Static FCM access token was rejected; it cannot be refreshed");
    }
}

/// The fields of a Google service-account key file this service uses.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Service account identity, the assertion issuer.
    pub client_email: String,
    /// PKCS#8 PEM RSA private key.
    pub private_key: String,
    /// OAuth token endpoint.
    #[serde(default)]
    pub token_uri: Option<String>,
    /// Project the account belongs to.
    #[serde(default)]
    pub project_id: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// Read a service-account JSON key file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read FCM credentials {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse FCM credentials {}", path.display()))
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Access tokens minted from a service-account key.
pub struct ServiceAccountTokens {
    client: reqwest::Client,
    client_email: String,
    signing_key: PKey<Private>,
    token_uri: String,
    clock: SharedClock,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ServiceAccountTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountTokens")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountTokens {
    /// Token source for `key`.
    pub fn new(client: reqwest::Client, key: &ServiceAccountKey, clock: SharedClock) -> Result<Self> {
        let signing_key = PKey::private_key_from_pem(key.private_key.as_bytes())
            .context("FCM credentials hold no usable private key")?;
        Ok(Self {
            client,
            client_email: key.client_email.clone(),
            signing_key,
            token_uri: key
                .token_uri
                .clone()
                .unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string()),
            clock,
            cached: Mutex::new(None),
        })
    }

    fn assertion(&self, now: DateTime<Utc>) -> Result<String, PushError> {
        let header = BASE64URL.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let lifetime = i64::try_from(OAUTH_ASSERTION_LIFETIME.as_secs()).unwrap_or(3600);
        let claims = serde_json::to_vec(&AssertionClaims {
            iss: &self.client_email,
            scope: FCM_OAUTH_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + lifetime,
        })
        .map_err(|e| PushError::Other(format!("Failed to encode OAuth claims: {e}")))?;
        let signing_input = format!("{header}.{}", BASE64URL.encode(claims));

        let signature = Signer::new(MessageDigest::sha256(), &self.signing_key)
            .and_then(|mut signer| signer.sign_oneshot_to_vec(signing_input.as_bytes()))
            .map_err(|e| PushError::Other(format!("Failed to sign OAuth assertion: {e}")))?;

        Ok(format!("{signing_input}.{}", BASE64URL.encode(signature)))
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<CachedToken, PushError> {
        let assertion = self.assertion(now)?;
        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await
            .map_err(|e| PushError::Other(format!("OAuth token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Other(format!(
                "OAuth token request rejected (HTTP {}): {body}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PushError::Other(format!("Undecodable OAuth token response: {e}")))?;
        log::info!(
            "[OAuth] Fetched FCM access token for {} (valid {}s)",
            self.client_email,
            body.expires_in
        );
        Ok(CachedToken {
            token: body.access_token,
            expires_at: now + chrono::Duration::seconds(body.expires_in.max(0)),
        })
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountTokens {
    async fn access_token(&self) -> Result<String, PushError> {
        let now = self.clock.now();
        let margin = chrono::Duration::from_std(ACCESS_TOKEN_REFRESH_MARGIN)
            .unwrap_or(chrono::Duration::seconds(60));

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if now + margin < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let fresh = self.fetch(now).await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use openssl::rsa::Rsa;
    use openssl::sign::Verifier;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service_account(token_uri: String) -> (ServiceAccountKey, PKey<Private>) {
        let rsa = Rsa::generate(2048).expect("rsa key");
        let pkey = PKey::from_rsa(rsa).expect("pkey");
        let pem = pkey.private_key_to_pem_pkcs8().expect("pem");
        let key = ServiceAccountKey {
            client_email: "relay@demo.iam.gserviceaccount.com".to_string(),
            private_key: String::from_utf8(pem).expect("utf8 pem"),
            token_uri: Some(token_uri),
            project_id: Some("demo".to_string()),
        };
        (key, pkey)
    }

    fn token_response(token: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": token,
            "expires_in": 3600,
            "token_type": "Bearer"
        }))
    }

    #[tokio::test]
    async fn test_signed_assertion_is_exchanged_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
            .respond_with(token_response("ya29.first"))
            .expect(1)
            .mount(&server)
            .await;

        let (key, pkey) = service_account(format!("{}/token", server.uri()));
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp"),
        ));
        let tokens =
            ServiceAccountTokens::new(reqwest::Client::new(), &key, clock).expect("token source");

        assert_eq!(tokens.access_token().await.expect("token"), "ya29.first");
        assert_eq!(tokens.access_token().await.expect("cached"), "ya29.first");

        let requests = server.received_requests().await.expect("recorded requests");
        let body = String::from_utf8(requests[0].body.clone()).expect("utf8 body");
        let assertion = body
            .split('&')
            .find_map(|pair| pair.strip_prefix("assertion="))
            .expect("assertion field");
        let parts: Vec<&str> = assertion.split('.').collect();
        assert_eq!(parts.len(), 3);

        let claims: serde_json::Value =
            serde_json::from_slice(&BASE64URL.decode(parts[1]).expect("claims b64"))
                .expect("claims json");
        assert_eq!(claims["iss"], "relay@demo.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], FCM_OAUTH_SCOPE);
        assert_eq!(claims["aud"], format!("{}/token", server.uri()));
        assert_eq!(claims["exp"], 1_700_000_000 + 3600);

        let signature = BASE64URL.decode(parts[2]).expect("signature b64");
        let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey).expect("verifier");
        let signed = format!("{}.{}", parts[0], parts[1]);
        assert!(verifier
            .verify_oneshot(&signature, signed.as_bytes())
            .expect("verify"));
    }

    #[tokio::test]
    async fn test_token_refreshed_near_expiry_and_after_invalidate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(token_response("ya29.first"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(token_response("ya29.second"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(token_response("ya29.third"))
            .mount(&server)
            .await;

        let (key, _) = service_account(format!("{}/token", server.uri()));
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp"),
        ));
        let tokens = ServiceAccountTokens::new(reqwest::Client::new(), &key, clock.clone())
            .expect("token source");

        assert_eq!(tokens.access_token().await.expect("token"), "ya29.first");

        // Inside the refresh margin.
        clock.advance(chrono::Duration::seconds(3600 - 30));
        assert_eq!(tokens.access_token().await.expect("token"), "ya29.second");

        tokens.invalidate().await;
        assert_eq!(tokens.access_token().await.expect("token"), "ya29.third");
    }

    #[tokio::test]
    async fn test_rejected_exchange_is_other() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let (key, _) = service_account(format!("{}/token", server.uri()));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tokens =
            ServiceAccountTokens::new(reqwest::Client::new(), &key, clock).expect("token source");
        assert!(matches!(tokens.access_token().await, Err(PushError::Other(_))));
    }

    #[test]
    fn test_key_without_private_key_is_rejected() {
        let key = ServiceAccountKey {
            client_email: "relay@demo".to_string(),
            private_key: "not a pem".to_string(),
            token_uri: None,
            project_id: None,
        };
        let clock = Arc::new(ManualClock::new(Utc::now()));
        assert!(ServiceAccountTokens::new(reqwest::Client::new(), &key, clock).is_err());
    }

    #[test]
    fn test_load_key_file() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("sa.json");
        std::fs::write(
            &path,
            r#"{"type":"service_account","project_id":"demo","client_email":"a@b","private_key":"pem"}"#,
        )
        .expect("write");

        let key = ServiceAccountKey::load(&path).expect("load");
        assert_eq!(key.project_id.as_deref(), Some("demo"));
        assert_eq!(key.token_uri, None);
        assert!(!format!("{key:?}").contains("pem"));
    }
}
