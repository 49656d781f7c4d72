//! JSON-over-HTTP registration API.
//!
//! ```text
//! POST /v1/tokens/register          RegisterTokenRequest
//! POST /v1/tokens/unregister        UnregisterTokenRequest
//! POST /v1/tracked-ids/register     RegisterTrackedIdRequest
//! POST /v1/tracked-ids/unregister   UnregisterTrackedIdRequest
//! GET  /health
//! ```
//!
//! Success is `204 No Content`. Failures carry `{"error": "..."}`:
//!
//! | failure            | status |
//! |--------------------|--------|
//! | malformed request  | 400    |
//! | stale request      | 401    |
//! | bad signature      | 401    |
//! | untrusted key      | 403    |
//! | not registered     | 404    |
//! | storage failure    | 500    |

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::registration::{
    RegisterTokenRequest, RegisterTrackedIdRequest, Registrar, RegistrationError,
    UnregisterTokenRequest, UnregisterTrackedIdRequest,
};

/// Shared handler state.
#[derive(Clone, Debug)]
pub struct ApiState {
    registrar: Arc<Registrar>,
}

impl ApiState {
    /// Serve requests against `registrar`.
    pub fn new(registrar: Arc<Registrar>) -> Self {
        Self { registrar }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Build the router.
pub fn app(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/v1/tokens/register", post(register_token))
        .route("/v1/tokens/unregister", post(unregister_token))
        .route("/v1/tracked-ids/register", post(register_tracked_id))
        .route("/v1/tracked-ids/unregister", post(unregister_tracked_id))
        .with_state(state)
}

/// Serve `app` on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("[Api] Listening on {addr}");
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

fn status_for(error: &RegistrationError) -> StatusCode {
    match error {
        RegistrationError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        RegistrationError::StaleRequest | RegistrationError::BadSignature => {
            StatusCode::UNAUTHORIZED
        }
        RegistrationError::UntrustedKey => StatusCode::FORBIDDEN,
        RegistrationError::NotRegistered => StatusCode::NOT_FOUND,
        RegistrationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

fn respond(operation: &str, result: Result<(), RegistrationError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                log::error!("[Api] {operation} failed: {e}");
            } else {
                log::debug!("[Api] {operation} rejected ({status}): {e}");
            }
            error_response(status, e.to_string())
        }
    }
}

fn rejected(rejection: &JsonRejection) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        format!("Malformed request: {}", rejection.body_text()),
    )
}

async fn register_token(
    State(state): State<ApiState>,
    body: Result<Json<RegisterTokenRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(req)) => respond("register token", state.registrar.register_token(&req).await),
        Err(rejection) => rejected(&rejection),
    }
}

async fn unregister_token(
    State(state): State<ApiState>,
    body: Result<Json<UnregisterTokenRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(
            "unregister token",
            state.registrar.unregister_token(&req).await,
        ),
        Err(rejection) => rejected(&rejection),
    }
}

async fn register_tracked_id(
    State(state): State<ApiState>,
    body: Result<Json<RegisterTrackedIdRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(
            "register tracked id",
            state.registrar.register_tracked_id(&req).await,
        ),
        Err(rejection) => rejected(&rejection),
    }
}

async fn unregister_tracked_id(
    State(state): State<ApiState>,
    body: Result<Json<UnregisterTrackedIdRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(req)) => respond(
            "unregister tracked id",
            state.registrar.unregister_tracked_id(&req).await,
        ),
        Err(rejection) => rejected(&rejection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (RegistrationError::MalformedRequest("x".into()), 400),
            (RegistrationError::StaleRequest, 401),
            (RegistrationError::BadSignature, 401),
            (RegistrationError::UntrustedKey, 403),
            (RegistrationError::NotRegistered, 404),
            (RegistrationError::Storage(StorageError::Poisoned), 500),
        ];
        for (error, status) in cases {
            assert_eq!(status_for(&error).as_u16(), status, "{error}");
        }
    }
}
