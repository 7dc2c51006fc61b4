//! OAuth 2.0 exchange client for the external provider (Google).
//!
//! Two external round trips:
//! 1. Build the consent URL embedding a CSRF state token
//! 2. Exchange the callback's authorization code for tokens
//!
//! Plus the silent refresh used by the broker's retrieve-for-use flow.
//! The identity scopes (`openid email profile`) are always requested in
//! addition to resource scopes; without them the identity bridge cannot
//! obtain an ID token.

mod state;

pub use state::{run_state_cleanup, StateEntry, StateManager};

use crate::config::GoogleOAuthConfig;
use crate::error::BrokerError;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

/// Scopes required so the token endpoint also returns an OpenID Connect
/// ID token for the identity bridge.
pub const IDENTITY_SCOPES: &[&str] = &["openid", "email", "profile"];

/// Tokens granted by the provider's token endpoint
#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// OpenID Connect ID token; present when the identity scopes were granted
    pub id_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes the provider actually granted (may differ from requested)
    pub granted_scopes: Vec<String>,
}

/// OAuth token response (standard OAuth 2.0 + OIDC)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Space-delimited granted scopes
    #[serde(default)]
    scope: Option<String>,
}

/// Client for the authorization-code grant against a single provider.
///
/// Stateless apart from configuration; every call is an independent,
/// cancellable remote request with a finite timeout.
#[derive(Clone)]
pub struct OAuthClient {
    config: GoogleOAuthConfig,
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: GoogleOAuthConfig, timeout_seconds: u64) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| {
                BrokerError::Configuration(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self { config, http })
    }

    /// Merge resource scopes with the always-required identity scopes,
    /// preserving order and dropping duplicates.
    pub fn requested_scopes(&self, resource_scopes: &[String]) -> Vec<String> {
        let mut scopes: Vec<String> = IDENTITY_SCOPES.iter().map(|s| s.to_string()).collect();
        for scope in resource_scopes {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        scopes
    }

    /// Build the provider's consent URL.
    ///
    /// `access_type=offline` and `prompt=consent` make the provider return
    /// a refresh token; `include_granted_scopes=true` carries previously
    /// granted scopes forward on reconnect.
    pub fn build_authorization_url(&self, scopes: &[String], state: &str) -> String {
        let scope_param = scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code&access_type=offline&include_granted_scopes=true&prompt=consent",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(&scope_param),
            urlencoding::encode(state)
        )
    }

    /// Exchange an authorization code for tokens.
    ///
    /// Fails with `Exchange` if the provider rejects the code, and with
    /// `ScopeMismatch` if the granted scopes are missing any requested
    /// scope — in that case the caller must not persist anything.
    pub async fn exchange_code(
        &self,
        code: &str,
        requested_scopes: &[String],
    ) -> Result<TokenGrant, BrokerError> {
        debug!(token_url = %self.config.token_url, "Exchanging authorization code");

        let grant = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.config.redirect_uri),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ])
            .await?;

        let missing: Vec<String> = requested_scopes
            .iter()
            .filter(|s| !grant.granted_scopes.contains(s))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(BrokerError::ScopeMismatch { missing });
        }

        Ok(grant)
    }

    /// Refresh an access token using a refresh token.
    ///
    /// The provider may omit a new refresh token; callers keep the old one
    /// in that case. Attempted at most once per retrieval by the broker.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, BrokerError> {
        debug!(token_url = %self.config.token_url, "Refreshing access token");

        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, BrokerError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    BrokerError::Provider("OAuth provider unreachable".to_string())
                } else {
                    BrokerError::Exchange("token request failed to send".to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            // Raw provider bodies never reach callers or info-level logs
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, "Token endpoint rejected request");
            return Err(BrokerError::Exchange(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|_| BrokerError::Exchange("invalid token response".to_string()))?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            has_id_token = token_response.id_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token request successful"
        );

        let expires_at = token_response
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds));
        let granted_scopes = token_response
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(TokenGrant {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            id_token: token_response.id_token,
            expires_at,
            granted_scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(token_url: String) -> GoogleOAuthConfig {
        GoogleOAuthConfig {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url,
            client_id: "test-client-id".to_string(),
            client_secret: "test-client-secret".to_string(),
            redirect_uri: "http://localhost:8080/api/oauth/google/callback".to_string(),
        }
    }

    fn test_client(token_url: String) -> OAuthClient {
        OAuthClient::new(test_config(token_url), 5).unwrap()
    }

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "ya29.abc",
            "refresh_token": "1//def",
            "id_token": "eyJhbGciOi.payload.sig",
            "expires_in": 3600,
            "scope": "openid email https://www.googleapis.com/auth/spreadsheets.readonly",
            "token_type": "Bearer"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "ya29.abc");
        assert_eq!(response.refresh_token.as_deref(), Some("1//def"));
        assert!(response.id_token.is_some());
        assert_eq!(response.expires_in, Some(3600));
        assert!(response.scope.unwrap().contains("openid"));
    }

    #[test]
    fn test_token_response_minimal() {
        let json = r#"{"access_token": "token_12345"}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "token_12345");
        assert!(response.refresh_token.is_none());
        assert!(response.id_token.is_none());
    }

    #[test]
    fn test_requested_scopes_include_identity() {
        let client = test_client("http://unused".to_string());
        let scopes = client.requested_scopes(&[
            "https://www.googleapis.com/auth/spreadsheets.readonly".to_string(),
            "email".to_string(),
        ]);

        assert_eq!(&scopes[..3], &["openid", "email", "profile"]);
        // Duplicate "email" was not added twice
        assert_eq!(scopes.len(), 4);
    }

    #[test]
    fn test_build_authorization_url() {
        let client = test_client("http://unused".to_string());
        let scopes = vec!["openid".to_string(), "email".to_string()];
        let url = client.build_authorization_url(&scopes, "random-state");

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=test-client-id"));
        assert!(url.contains("scope=openid%20email"));
        assert!(url.contains("state=random-state"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "ya29.fresh",
                    "refresh_token": "1//refresh",
                    "id_token": "header.payload.sig",
                    "expires_in": 3600,
                    "scope": "openid email profile"
                }"#,
            )
            .create_async()
            .await;

        let client = test_client(server.url());
        let requested: Vec<String> = ["openid", "email", "profile"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let grant = client.exchange_code("auth-code", &requested).await.unwrap();
        assert_eq!(grant.access_token, "ya29.fresh");
        assert_eq!(grant.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(grant.id_token.as_deref(), Some("header.payload.sig"));
        assert!(grant.expires_at.unwrap() > Utc::now());
        assert_eq!(grant.granted_scopes, requested);
    }

    #[tokio::test]
    async fn test_exchange_code_scope_mismatch() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "ya29.fresh",
                    "expires_in": 3600,
                    "scope": "openid email"
                }"#,
            )
            .create_async()
            .await;

        let client = test_client(server.url());
        let requested: Vec<String> = [
            "openid",
            "email",
            "https://www.googleapis.com/auth/spreadsheets.readonly",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let err = client
            .exchange_code("auth-code", &requested)
            .await
            .unwrap_err();
        match err {
            BrokerError::ScopeMismatch { missing } => {
                assert_eq!(
                    missing,
                    vec!["https://www.googleapis.com/auth/spreadsheets.readonly".to_string()]
                );
            }
            other => panic!("expected ScopeMismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_code_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let err = client.exchange_code("bad-code", &[]).await.unwrap_err();

        // Surfaces as Exchange with no provider body leaked
        assert!(matches!(err, BrokerError::Exchange(_)));
        assert!(!err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_refresh_success_without_new_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "ya29.refreshed", "expires_in": 3600}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        let grant = client.refresh("1//old-refresh").await.unwrap();
        assert_eq!(grant.access_token, "ya29.refreshed");
        assert!(grant.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(401)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let client = test_client(server.url());
        assert!(matches!(
            client.refresh("1//revoked").await,
            Err(BrokerError::Exchange(_))
        ));
    }
}
