//! Identity provider client and identity bridge.
//!
//! The identity provider (a Supabase-shaped auth service) owns all session
//! issuance and validation. This module is a thin HTTP client over its
//! auth API:
//!
//! - `bridge` — the identity bridge: exchange a foreign OpenID Connect ID
//!   token for this system's own session (sign-in-with-external-token)
//! - `sign_up` / `sign_in_with_password` / `sign_out` / `refresh_session` —
//!   passthrough session management
//! - `get_user` — resolve a bearer session token to its user, used by the
//!   HTTP surface to derive `user_id` for every store operation
//!
//! There is no anonymous or test-user fallback in any code path; tests run
//! against a mock identity server instead.

use crate::config::IdentityConfig;
use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// A session issued by the identity provider
#[derive(Clone, Debug, Serialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: String,
    pub email: Option<String>,
}

/// The authenticated caller behind a validated bearer token
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: Option<String>,
}

/// Session response from the identity provider's token/signup endpoints
#[derive(Deserialize, Debug)]
struct SessionResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: UserPayload,
}

#[derive(Deserialize, Debug)]
struct UserPayload {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

/// HTTP client for the identity provider's auth API
#[derive(Clone)]
pub struct IdentityClient {
    config: IdentityConfig,
    http: reqwest::Client,
}

impl IdentityClient {
    pub fn new(config: IdentityConfig, timeout_seconds: u64) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| {
                BrokerError::Configuration(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self { config, http })
    }

    /// Exchange a foreign ID token for this system's own session.
    ///
    /// The identity provider verifies the token's signature and issuer,
    /// then signs in (or creates) the user keyed by the verified subject.
    /// Rejection propagates as `Bridge` — a user-facing authentication
    /// failure, never a silent fallback.
    pub async fn bridge(&self, id_token: &str) -> Result<Session, BrokerError> {
        debug!("Bridging foreign ID token to local session");

        let response = self
            .http
            .post(format!(
                "{}/auth/v1/token?grant_type=id_token",
                self.config.base_url
            ))
            .header("apikey", &self.config.service_key)
            .json(&json!({ "provider": "google", "id_token": id_token }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "Identity provider rejected ID token");
            return Err(BrokerError::Bridge(format!(
                "identity provider returned {}",
                status
            )));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|_| BrokerError::Bridge("invalid session response".to_string()))?;

        Ok(into_session(session))
    }

    /// Create a new user with email and password.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<Session, BrokerError> {
        let body = json!({
            "email": email,
            "password": password,
            "data": { "display_name": display_name },
        });
        self.session_request(&format!("{}/auth/v1/signup", self.config.base_url), &body)
            .await
    }

    /// Sign in an existing user with email and password.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BrokerError> {
        let body = json!({ "email": email, "password": password });
        self.session_request(
            &format!(
                "{}/auth/v1/token?grant_type=password",
                self.config.base_url
            ),
            &body,
        )
        .await
    }

    /// Exchange a refresh token for a fresh session.
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, BrokerError> {
        let body = json!({ "refresh_token": refresh_token });
        self.session_request(
            &format!(
                "{}/auth/v1/token?grant_type=refresh_token",
                self.config.base_url
            ),
            &body,
        )
        .await
    }

    /// Invalidate the caller's session.
    ///
    /// Sign-out only invalidates the session; stored provider credentials
    /// are untouched.
    pub async fn sign_out(&self, access_token: &str) -> Result<(), BrokerError> {
        let response = self
            .http
            .post(format!("{}/auth/v1/logout", self.config.base_url))
            .header("apikey", &self.config.service_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(BrokerError::Unauthenticated(
                "sign-out rejected".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a bearer session token to the authenticated user.
    ///
    /// This is the only source of `user_id` for store operations.
    pub async fn get_user(&self, access_token: &str) -> Result<AuthenticatedUser, BrokerError> {
        let response = self
            .http
            .get(format!("{}/auth/v1/user", self.config.base_url))
            .header("apikey", &self.config.service_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(BrokerError::Unauthenticated(
                "session token rejected".to_string(),
            ));
        }

        let user: UserPayload = response
            .json()
            .await
            .map_err(|_| BrokerError::Unauthenticated("invalid user response".to_string()))?;

        Ok(AuthenticatedUser {
            user_id: user.id,
            email: user.email,
        })
    }

    async fn session_request(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<Session, BrokerError> {
        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.service_key)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "Identity provider rejected request");
            return Err(BrokerError::Unauthenticated(format!(
                "identity provider returned {}",
                status
            )));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|_| BrokerError::Unauthenticated("invalid session response".to_string()))?;

        Ok(into_session(session))
    }
}

fn into_session(response: SessionResponse) -> Session {
    Session {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        user_id: response.user.id,
        email: response.user.email,
    }
}

fn transport_error(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() || e.is_connect() {
        BrokerError::Provider("identity provider unreachable".to_string())
    } else {
        BrokerError::Provider("identity provider request failed".to_string())
    }
}
