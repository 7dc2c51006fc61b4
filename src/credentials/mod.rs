//! Encrypted credential storage for third-party provider secrets.
//!
//! This module provides secure at-rest storage for OAuth tokens and
//! user-supplied service keys using AES-256-GCM encryption backed by SQLite.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - upsert/get/delete per (user, provider)│
//! │  - Transparent encryption/decryption     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!      (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Vault                              │
//! │  - AES-256-GCM, unique nonce per seal    │
//! │  - Tamper detection on open              │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - Ciphertext blobs at rest              │
//! │  - UNIQUE(user_id, provider) upsert      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Plaintext tokens exist only between the store boundary and the caller;
//!   they are never persisted or logged
//! - Every operation is scoped by a caller-supplied `user_id` obtained from
//!   a validated session, never from request bodies or stored metadata
//! - Authenticated encryption: a tampered or wrong-key blob fails to open

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod store;
mod vault;

pub use store::CredentialStore;
pub use vault::Vault;

/// Third-party systems the broker stores per-user secrets for.
///
/// A user holds at most one active credential record per provider;
/// reconnecting replaces the previous record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provider {
    /// Google OAuth tokens (Sheets/Drive resource access + identity)
    #[serde(rename = "google")]
    Google,
    /// User-supplied database service key (e.g. their own Supabase project)
    #[serde(rename = "external-database")]
    ExternalDatabase,
}

impl Provider {
    /// Storage tag for this provider (also the wire name on the API)
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::ExternalDatabase => "external-database",
        }
    }

    /// Parse a storage/wire tag back into a provider
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "google" => Some(Provider::Google),
            "external-database" => Some(Provider::ExternalDatabase),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials for accessing an external provider.
///
/// This is the plaintext form handed to and returned by the credential
/// store; at rest both tokens are sealed by the vault.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Access token or service key used for API requests
    pub access_token: String,

    /// Refresh token used to obtain new access tokens (absent for
    /// non-expiring secrets such as database service keys)
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC); `None` for non-expiring secrets
    pub expires_at: Option<DateTime<Utc>>,

    /// Scopes granted by the provider, in grant order
    pub scopes: Vec<String>,

    /// Provider-specific auxiliary data (e.g. target project URL).
    /// Never secret, never encrypted.
    pub metadata: serde_json::Value,
}

impl Credentials {
    /// Whether the access token's expiry has passed.
    ///
    /// Credentials without an expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }
}
