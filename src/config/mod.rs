//! Environment-driven configuration.
//!
//! All secrets and endpoints are read once at process start. Startup fails
//! fast if any required value is absent; nothing falls back to a default
//! that could silently weaken security.

use crate::error::BrokerError;

/// Default SQLite database path
fn default_database_path() -> String {
    "doki.db".to_string()
}

/// Default bind address for the HTTP surface
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Default timeout for calls to the OAuth provider, identity provider,
/// and direct-credential probe targets (seconds)
const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 10;

/// Default lifetime of an issued OAuth CSRF state token (seconds)
const DEFAULT_STATE_TTL_SECONDS: i64 = 600;

/// Google OAuth endpoints and client credentials
#[derive(Debug, Clone)]
pub struct GoogleOAuthConfig {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Identity provider (session issuer) endpoints and service key
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Base URL of the identity provider (e.g. https://abc.supabase.co)
    pub base_url: String,
    /// Service key sent as the `apikey` header on every call
    pub service_key: String,
}

/// Complete broker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base64-encoded 32-byte master key for the vault
    /// (provision with `openssl rand -base64 32`)
    pub encryption_key: String,
    pub google: GoogleOAuthConfig,
    pub identity: IdentityConfig,
    pub database_path: String,
    pub bind_addr: String,
    pub http_timeout_seconds: u64,
    pub state_ttl_seconds: i64,
}

/// Read a required environment variable, failing with a `Configuration`
/// error naming the variable (never echoing its value).
fn require_env(name: &str) -> Result<String, BrokerError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BrokerError::Configuration(format!("{} is not set", name)))
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Required: `DOKI_ENCRYPTION_KEY`, `DOKI_GOOGLE_CLIENT_ID`,
    /// `DOKI_GOOGLE_CLIENT_SECRET`, `DOKI_GOOGLE_REDIRECT_URI`,
    /// `DOKI_IDENTITY_URL`, `DOKI_IDENTITY_SERVICE_KEY`.
    pub fn from_env() -> Result<Self, BrokerError> {
        Ok(Self {
            encryption_key: require_env("DOKI_ENCRYPTION_KEY")?,
            google: GoogleOAuthConfig {
                auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                client_id: require_env("DOKI_GOOGLE_CLIENT_ID")?,
                client_secret: require_env("DOKI_GOOGLE_CLIENT_SECRET")?,
                redirect_uri: require_env("DOKI_GOOGLE_REDIRECT_URI")?,
            },
            identity: IdentityConfig {
                base_url: require_env("DOKI_IDENTITY_URL")?,
                service_key: require_env("DOKI_IDENTITY_SERVICE_KEY")?,
            },
            database_path: std::env::var("DOKI_DATABASE_PATH")
                .unwrap_or_else(|_| default_database_path()),
            bind_addr: std::env::var("DOKI_BIND_ADDR").unwrap_or_else(|_| default_bind_addr()),
            http_timeout_seconds: std::env::var("DOKI_HTTP_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECONDS),
            state_ttl_seconds: std::env::var("DOKI_STATE_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STATE_TTL_SECONDS),
        })
    }
}
