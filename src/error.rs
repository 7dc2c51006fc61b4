//! Broker error taxonomy.
//!
//! Every failure the broker can surface maps to one of these variants so
//! callers can branch on a stable kind instead of parsing messages. Raw
//! provider response bodies and secret values never appear in `Display`
//! output; anything sensitive is logged at debug level only, redacted.

use std::fmt;

/// Errors surfaced by the credential broker and its components.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Required configuration is missing or invalid. Fatal at startup.
    Configuration(String),
    /// OAuth callback `state` was never issued, already used, or expired.
    StateMismatch,
    /// The OAuth provider rejected the code exchange or token refresh.
    Exchange(String),
    /// The provider granted fewer scopes than were requested.
    ScopeMismatch { missing: Vec<String> },
    /// The identity provider rejected the foreign ID token.
    Bridge(String),
    /// The caller's session token or sign-in credentials were rejected by
    /// the identity provider.
    Unauthenticated(String),
    /// Stored ciphertext failed authenticated decryption (tamper or key
    /// mismatch). Fatal for that record; reconnect required.
    Decryption(String),
    /// No credential record exists for this (user, provider) pair.
    NotFound,
    /// The credential is expired and could not be silently refreshed.
    CredentialExpired,
    /// The direct-credential connectivity probe was rejected as
    /// unauthenticated/unauthorized. Nothing was persisted.
    ProbeAuth,
    /// The credential store failed at the database layer.
    Storage(String),
    /// A remote call failed at the transport level (timeout, connection
    /// refused). Retryable by the caller.
    Provider(String),
}

impl BrokerError {
    /// Stable machine-readable kind, used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Configuration(_) => "configuration_error",
            BrokerError::StateMismatch => "state_mismatch",
            BrokerError::Exchange(_) => "exchange_error",
            BrokerError::ScopeMismatch { .. } => "scope_mismatch",
            BrokerError::Bridge(_) => "bridge_error",
            BrokerError::Unauthenticated(_) => "unauthenticated",
            BrokerError::Decryption(_) => "decryption_error",
            BrokerError::NotFound => "not_found",
            BrokerError::CredentialExpired => "credential_expired",
            BrokerError::ProbeAuth => "probe_auth_error",
            BrokerError::Storage(_) => "storage_error",
            BrokerError::Provider(_) => "provider_unavailable",
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            BrokerError::StateMismatch => {
                write!(f, "OAuth state mismatch; restart the connect flow")
            }
            BrokerError::Exchange(msg) => write!(f, "OAuth token exchange failed: {}", msg),
            BrokerError::ScopeMismatch { missing } => write!(
                f,
                "OAuth provider did not grant required scopes: {}",
                missing.join(", ")
            ),
            BrokerError::Bridge(msg) => write!(f, "identity bridge failed: {}", msg),
            BrokerError::Unauthenticated(msg) => write!(f, "authentication failed: {}", msg),
            BrokerError::Decryption(msg) => write!(
                f,
                "credential store corrupted, reconnect required: {}",
                msg
            ),
            BrokerError::NotFound => write!(f, "no credential stored for this provider"),
            BrokerError::CredentialExpired => {
                write!(f, "credential expired and refresh failed; reconnect required")
            }
            BrokerError::ProbeAuth => {
                write!(f, "supplied credential was rejected by the target system")
            }
            BrokerError::Storage(msg) => write!(f, "credential store error: {}", msg),
            BrokerError::Provider(msg) => write!(f, "provider unavailable: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}
