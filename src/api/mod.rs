//! HTTP surface for the credential broker.
//!
//! Thin axum layer over [`CredentialBroker`] and [`IdentityClient`]; every
//! authenticated route resolves the caller's `user_id` from the bearer
//! session token via the identity provider before touching the store.
//! Error bodies carry a stable `kind` alongside a generic message — raw
//! provider responses and secret values never appear here.

use crate::auth::extract_bearer_token;
use crate::broker::{ConnectionStatus, CredentialBroker};
use crate::credentials::Provider;
use crate::error::BrokerError;
use crate::identity::{AuthenticatedUser, IdentityClient, Session};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared application state for the broker API
#[derive(Clone)]
pub struct AppState {
    pub broker: CredentialBroker,
    pub identity: IdentityClient,
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

/// Application error type mapping broker errors onto HTTP statuses
struct AppError(BrokerError);

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::StateMismatch
            | BrokerError::Bridge(_)
            | BrokerError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            // Exchange failures (denied consent, rejected code) are
            // user-facing: restarting the connect flow resolves them
            BrokerError::ScopeMismatch { .. }
            | BrokerError::ProbeAuth
            | BrokerError::Exchange(_) => StatusCode::BAD_REQUEST,
            BrokerError::NotFound => StatusCode::NOT_FOUND,
            BrokerError::CredentialExpired => StatusCode::CONFLICT,
            BrokerError::Provider(_) => StatusCode::BAD_GATEWAY,
            BrokerError::Configuration(_)
            | BrokerError::Decryption(_)
            | BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind(),
        });

        (status, body).into_response()
    }
}

/// Request body for POST /api/auth/signup
#[derive(Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
}

/// Request body for POST /api/auth/signin
#[derive(Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

/// Request body for POST /api/auth/refresh
#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Request body for POST /api/connections/database
#[derive(Deserialize)]
pub struct ConnectDatabaseRequest {
    pub project_url: String,
    pub service_key: String,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub session: Session,
}

#[derive(Serialize)]
pub struct CallbackResponse {
    pub session: Session,
    pub connection_status: ConnectionStatus,
}

#[derive(Serialize)]
pub struct ListConnectionsResponse {
    pub connections: Vec<Provider>,
}

#[derive(Serialize)]
pub struct CredentialResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Create the broker API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/signup", post(sign_up))
        .route("/api/auth/signin", post(sign_in))
        .route("/api/auth/signout", post(sign_out))
        .route("/api/auth/refresh", post(refresh_session))
        .route("/api/oauth/google/start", get(oauth_start))
        .route("/api/oauth/google/callback", get(oauth_callback))
        .route("/api/connections", get(list_connections))
        .route("/api/connections/database", post(connect_database))
        .route("/api/connections/:provider/token", get(get_credential))
        .route("/api/connections/:provider", delete(disconnect))
        .with_state(Arc::new(state))
}

/// Resolve the caller from the bearer token; the returned `user_id` is the
/// only ownership key ever used for store operations.
async fn require_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, AppError> {
    let token = extract_bearer_token(headers)
        .map_err(|e| AppError(BrokerError::Unauthenticated(e.to_string())))?;
    Ok(state.identity.get_user(&token).await?)
}

fn parse_provider(name: &str) -> Result<Provider, AppError> {
    Provider::parse(name).ok_or(AppError(BrokerError::NotFound))
}

/// POST /api/auth/signup
async fn sign_up(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignUpRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state
        .identity
        .sign_up(&body.email, &body.password, &body.display_name)
        .await?;
    Ok(Json(SessionResponse { session }))
}

/// POST /api/auth/signin
async fn sign_in(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignInRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state
        .identity
        .sign_in_with_password(&body.email, &body.password)
        .await?;
    Ok(Json(SessionResponse { session }))
}

/// POST /api/auth/signout
///
/// Invalidates the session only; stored provider credentials survive until
/// an explicit disconnect.
async fn sign_out(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let token = extract_bearer_token(&headers)
        .map_err(|e| AppError(BrokerError::Unauthenticated(e.to_string())))?;
    state.identity.sign_out(&token).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /api/auth/refresh
async fn refresh_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.identity.refresh_session(&body.refresh_token).await?;
    Ok(Json(SessionResponse { session }))
}

/// GET /api/oauth/google/start
///
/// Redirects to the provider consent page with a fresh CSRF state.
async fn oauth_start(State(state): State<Arc<AppState>>) -> Redirect {
    let scopes: Vec<String> = crate::broker::DEFAULT_RESOURCE_SCOPES
        .iter()
        .map(|s| s.to_string())
        .collect();
    let request = state.broker.initiate_oauth(&scopes);
    Redirect::temporary(&request.url)
}

/// GET /api/oauth/google/callback
///
/// Completes the connect flow: state check, code exchange, identity
/// bridge, credential storage. A storage failure after the session was
/// established reports `connection_status: storage_failed` with the
/// session intact.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<CallbackResponse>, AppError> {
    if let Some(error) = callback.error {
        warn!(error = %error, "OAuth provider reported authorization failure");
        return Err(AppError(BrokerError::Exchange(
            "provider denied authorization".to_string(),
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError(BrokerError::Exchange("missing 'code' parameter".to_string())))?;
    let csrf_state = callback
        .state
        .ok_or(AppError(BrokerError::StateMismatch))?;

    let result = state.broker.complete_oauth(&code, &csrf_state).await?;

    Ok(Json(CallbackResponse {
        session: result.session,
        connection_status: result.connection,
    }))
}

/// GET /api/connections
async fn list_connections(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListConnectionsResponse>, AppError> {
    let user = require_user(&state, &headers).await?;
    let connections = state.broker.list_connections(&user.user_id)?;
    Ok(Json(ListConnectionsResponse { connections }))
}

/// POST /api/connections/database
///
/// Connects a user-supplied database service key after a successful
/// connectivity probe.
async fn connect_database(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ConnectDatabaseRequest>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user = require_user(&state, &headers).await?;

    debug!(user_id = %user.user_id, "Connecting direct database credential");
    state
        .broker
        .connect_direct(&user.user_id, &body.service_key, &body.project_url)
        .await?;

    Ok(Json(SuccessResponse { success: true }))
}

/// GET /api/connections/:provider/token
///
/// Returns a decrypted, usable credential, silently refreshing it first if
/// expired and refreshable.
async fn get_credential(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<Json<CredentialResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let user = require_user(&state, &headers).await?;

    let credentials = state
        .broker
        .get_active_credential(&user.user_id, provider)
        .await?;

    Ok(Json(CredentialResponse {
        access_token: credentials.access_token,
        expires_at: credentials.expires_at,
        metadata: credentials.metadata,
    }))
}

/// DELETE /api/connections/:provider
async fn disconnect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    let provider = parse_provider(&provider)?;
    let user = require_user(&state, &headers).await?;

    state.broker.disconnect(&user.user_id, provider)?;
    Ok(Json(SuccessResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        let callback: OAuthCallback =
            serde_json::from_str(r#"{"code": "auth_code_123", "state": "csrf_state_456"}"#)
                .unwrap();
        assert_eq!(callback.code.as_deref(), Some("auth_code_123"));
        assert_eq!(callback.state.as_deref(), Some("csrf_state_456"));
        assert!(callback.error.is_none());
    }

    #[test]
    fn test_connection_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Connected).unwrap(),
            "\"connected\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::StorageFailed).unwrap(),
            "\"storage_failed\""
        );
    }

    #[test]
    fn test_parse_provider_rejects_unknown() {
        assert!(parse_provider("google").is_ok());
        assert!(parse_provider("external-database").is_ok());
        assert!(parse_provider("github").is_err());
    }
}
