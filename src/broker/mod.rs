//! Credential broker orchestration.
//!
//! Composes the OAuth exchange client, identity bridge, and credential
//! store into the end-to-end connect/retrieve flows. The three collaborators
//! live in independent trust domains, so the connect-via-OAuth flow is a
//! saga with explicit partial-failure behavior rather than a transaction:
//!
//! 1. Issue consent URL with a fresh CSRF state
//! 2. Callback: verify state (fail closed), exchange code for tokens
//! 3. Bridge the ID token to a local session
//! 4. Upsert provider tokens under the session's user — if this last step
//!    fails the session survives and the result reports the storage failure
//!    as a retryable partial success; authentication is never rolled back.

use crate::credentials::{CredentialStore, Credentials, Provider};
use crate::error::BrokerError;
use crate::identity::{IdentityClient, Session};
use crate::oauth::{OAuthClient, StateManager};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resource scopes requested by default when connecting Google
pub const DEFAULT_RESOURCE_SCOPES: &[&str] =
    &["https://www.googleapis.com/auth/spreadsheets.readonly"];

/// An issued authorization request: the consent URL to redirect the user
/// to, and the state token embedded in it.
#[derive(Clone, Debug, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Outcome of storing the provider connection after authentication
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Tokens stored; the provider is connected
    Connected,
    /// Session established but credential storage failed; the user is
    /// authenticated and can retry the connect flow
    StorageFailed,
}

/// Result of completing the OAuth connect flow
#[derive(Clone, Debug, Serialize)]
pub struct ConnectResult {
    pub session: Session,
    pub connection: ConnectionStatus,
}

/// Orchestrator for the credential connect/retrieve/disconnect flows.
///
/// Stateless per request; the only shared state is the store handle and
/// the in-memory CSRF state map, both safe for concurrent use. Every
/// operation is partitioned by `user_id`, so no cross-user synchronization
/// exists anywhere.
#[derive(Clone)]
pub struct CredentialBroker {
    oauth: OAuthClient,
    identity: IdentityClient,
    store: Arc<CredentialStore>,
    states: StateManager,
    probe_http: reqwest::Client,
}

impl CredentialBroker {
    pub fn new(
        oauth: OAuthClient,
        identity: IdentityClient,
        store: Arc<CredentialStore>,
        states: StateManager,
        probe_timeout_seconds: u64,
    ) -> Result<Self, BrokerError> {
        let probe_http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(probe_timeout_seconds))
            .build()
            .map_err(|e| {
                BrokerError::Configuration(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            oauth,
            identity,
            store,
            states,
            probe_http,
        })
    }

    /// Begin the connect-via-OAuth flow.
    ///
    /// Issues a fresh single-use state token and returns the provider
    /// consent URL embedding it. Identity scopes are always added to the
    /// supplied resource scopes.
    pub fn initiate_oauth(&self, resource_scopes: &[String]) -> AuthorizationRequest {
        let scopes = self.oauth.requested_scopes(resource_scopes);
        let state = self.states.create(scopes.clone());
        let url = self.oauth.build_authorization_url(&scopes, &state);

        debug!(state = %state, "Issued OAuth authorization request");
        AuthorizationRequest { url, state }
    }

    /// Complete the connect-via-OAuth flow from the provider callback.
    ///
    /// Fails closed with `StateMismatch` (and performs no store mutation)
    /// unless `state` matches a token this broker issued for the flow.
    /// After the session is established, a storage failure is reported as
    /// `ConnectionStatus::StorageFailed` rather than rolling back
    /// authentication.
    pub async fn complete_oauth(
        &self,
        code: &str,
        state: &str,
    ) -> Result<ConnectResult, BrokerError> {
        let entry = self
            .states
            .validate_and_consume(state)
            .ok_or(BrokerError::StateMismatch)?;

        let grant = self.oauth.exchange_code(code, &entry.scopes).await?;

        let id_token = grant.id_token.as_deref().ok_or_else(|| {
            BrokerError::Bridge("provider grant carried no ID token".to_string())
        })?;

        let session = self.identity.bridge(id_token).await?;

        let credentials = Credentials {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
            scopes: grant.granted_scopes,
            metadata: serde_json::json!({}),
        };

        let connection = match self
            .store
            .upsert(&session.user_id, Provider::Google, &credentials)
        {
            Ok(()) => {
                info!(user_id = %session.user_id, provider = %Provider::Google, "Provider connected");
                ConnectionStatus::Connected
            }
            Err(e) => {
                // Session stays valid; the connect is retryable
                warn!(user_id = %session.user_id, error = %e, "Credential storage failed after session was established");
                ConnectionStatus::StorageFailed
            }
        };

        Ok(ConnectResult {
            session,
            connection,
        })
    }

    /// Connect a user-supplied database service key (no OAuth round trip).
    ///
    /// Probes the target project with the supplied key before persisting
    /// anything: an authentication/authorization rejection aborts with
    /// `ProbeAuth`, while "resource not found" counts as liveness (the
    /// credential authenticates; the probed object simply doesn't exist).
    pub async fn connect_direct(
        &self,
        user_id: &str,
        service_key: &str,
        project_url: &str,
    ) -> Result<(), BrokerError> {
        self.probe_database(project_url, service_key).await?;

        let credentials = Credentials {
            access_token: service_key.to_string(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
            metadata: serde_json::json!({ "project_url": project_url }),
        };

        self.store
            .upsert(user_id, Provider::ExternalDatabase, &credentials)?;

        info!(user_id = %user_id, provider = %Provider::ExternalDatabase, "Direct credential connected");
        Ok(())
    }

    /// Retrieve a decrypted, usable credential for a provider.
    ///
    /// If the stored access token has expired and a refresh token exists,
    /// exactly one silent refresh is attempted; on success the refreshed
    /// pair is upserted and returned. If the refresh fails the stale record
    /// is left untouched and `CredentialExpired` tells the caller to prompt
    /// reconnection.
    pub async fn get_active_credential(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Credentials, BrokerError> {
        let credentials = self.store.get(user_id, provider)?;

        if !credentials.is_expired(Utc::now()) {
            return Ok(credentials);
        }

        let Some(refresh_token) = credentials.refresh_token.clone() else {
            return Err(BrokerError::CredentialExpired);
        };

        debug!(user_id = %user_id, provider = %provider, "Access token expired, attempting silent refresh");

        let grant = match self.oauth.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(user_id = %user_id, provider = %provider, error = %e, "Silent refresh failed");
                return Err(BrokerError::CredentialExpired);
            }
        };

        let refreshed = Credentials {
            access_token: grant.access_token,
            // Providers often omit the refresh token on refresh; keep the old one
            refresh_token: grant.refresh_token.or(Some(refresh_token)),
            expires_at: grant.expires_at,
            scopes: if grant.granted_scopes.is_empty() {
                credentials.scopes
            } else {
                grant.granted_scopes
            },
            metadata: credentials.metadata,
        };

        if let Err(e) = self.store.upsert(user_id, provider, &refreshed) {
            // The fresh token is still valid for this caller; the next
            // retrieval will refresh again
            warn!(user_id = %user_id, provider = %provider, error = %e, "Failed to persist refreshed credentials");
        }

        Ok(refreshed)
    }

    /// List providers the user currently has credentials stored for.
    pub fn list_connections(&self, user_id: &str) -> Result<Vec<Provider>, BrokerError> {
        self.store.list_by_user(user_id)
    }

    /// Explicit user-initiated disconnect: delete the stored record.
    pub fn disconnect(&self, user_id: &str, provider: Provider) -> Result<(), BrokerError> {
        if !self.store.delete(user_id, provider)? {
            return Err(BrokerError::NotFound);
        }
        info!(user_id = %user_id, provider = %provider, "Provider disconnected");
        Ok(())
    }

    /// Lightweight liveness probe against a user-supplied database project.
    async fn probe_database(
        &self,
        project_url: &str,
        service_key: &str,
    ) -> Result<(), BrokerError> {
        let response = self
            .probe_http
            .get(format!("{}/rest/v1/", project_url.trim_end_matches('/')))
            .header("apikey", service_key)
            .bearer_auth(service_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    BrokerError::Provider("target project unreachable".to_string())
                } else {
                    BrokerError::Provider("probe request failed".to_string())
                }
            })?;

        let status = response.status();
        match status.as_u16() {
            // 404 means the credential authenticated but the probed
            // resource is absent: a positive liveness signal
            200..=299 | 404 => {
                debug!(status = %status, "Direct credential probe succeeded");
                Ok(())
            }
            401 | 403 => Err(BrokerError::ProbeAuth),
            _ => Err(BrokerError::Provider(format!(
                "probe returned unexpected status {}",
                status
            ))),
        }
    }
}
