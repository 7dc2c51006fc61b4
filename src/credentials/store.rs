//! Encrypted credential persistence using SQLite.
//!
//! One row per (user_id, provider). Tokens are sealed by the vault before
//! they touch the database and opened on the way out.

use super::{Credentials, Provider, Vault};
use crate::error::BrokerError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token BLOB NOT NULL,     -- Sealed
///     refresh_token BLOB,             -- Sealed (optional)
///     expires_at TEXT,                -- ISO 8601 timestamp (optional)
///     scopes TEXT NOT NULL,           -- JSON array
///     metadata TEXT NOT NULL,         -- JSON object, never secret
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, provider)
/// );
/// ```
///
/// # Access control
/// Every operation takes `user_id` as an explicit argument. Callers obtain
/// it from a validated session token; there is no code path that derives it
/// from stored metadata or request input, so one user's session can never
/// read or overwrite another user's row.
///
/// # Thread safety
/// The connection is wrapped in a `Mutex`; concurrent upserts for the same
/// (user_id, provider) serialize at the database and resolve last-write-wins.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    vault: Vault,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    pub fn new<P: AsRef<Path>>(db_path: P, vault: Vault) -> Result<Self, BrokerError> {
        let conn = Connection::open(db_path)
            .map_err(|e| BrokerError::Storage(format!("failed to open database: {}", e)))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token BLOB NOT NULL,
                refresh_token BLOB,
                expires_at TEXT,
                scopes TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, provider)
            )
            "#,
            [],
        )
        .map_err(|e| BrokerError::Storage(format!("failed to create schema: {}", e)))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_user_provider ON credentials(user_id, provider)",
            [],
        )
        .map_err(|e| BrokerError::Storage(format!("failed to create index: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            vault,
        })
    }

    /// Stores credentials for a user and provider.
    ///
    /// If a record already exists for the pair it is replaced (reconnect
    /// semantics). Idempotent under repeated identical input; concurrent
    /// writers resolve last-write-wins.
    pub fn upsert(
        &self,
        user_id: &str,
        provider: Provider,
        credentials: &Credentials,
    ) -> Result<(), BrokerError> {
        let access_sealed = self.vault.seal(credentials.access_token.as_bytes())?;
        let refresh_sealed = credentials
            .refresh_token
            .as_deref()
            .map(|t| self.vault.seal(t.as_bytes()))
            .transpose()?;

        let expires_at = credentials.expires_at.map(|dt| dt.to_rfc3339());
        let scopes = serde_json::to_string(&credentials.scopes)
            .map_err(|e| BrokerError::Storage(format!("failed to encode scopes: {}", e)))?;
        let metadata = serde_json::to_string(&credentials.metadata)
            .map_err(|e| BrokerError::Storage(format!("failed to encode metadata: {}", e)))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    user_id, provider,
                    access_token, refresh_token,
                    expires_at, scopes, metadata,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(user_id, provider) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    scopes = excluded.scopes,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id,
                    provider.as_str(),
                    access_sealed,
                    refresh_sealed,
                    expires_at,
                    scopes,
                    metadata,
                    now,
                    now,
                ],
            )
            .map_err(|e| BrokerError::Storage(format!("failed to store credentials: {}", e)))?;

        Ok(())
    }

    /// Retrieves and decrypts credentials for a user and provider.
    ///
    /// Fails with `NotFound` if no record exists, so callers can
    /// distinguish "never connected" from "expired". Fails with
    /// `Decryption` if a stored blob no longer authenticates.
    pub fn get(&self, user_id: &str, provider: Provider) -> Result<Credentials, BrokerError> {
        let row = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT access_token, refresh_token, expires_at, scopes, metadata
                    FROM credentials
                    WHERE user_id = ?1 AND provider = ?2
                    "#,
                )
                .map_err(|e| BrokerError::Storage(format!("failed to prepare query: {}", e)))?;

            stmt.query_row(params![user_id, provider.as_str()], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()
            .map_err(|e| BrokerError::Storage(format!("failed to query credentials: {}", e)))?
        };

        let (access_sealed, refresh_sealed, expires_at, scopes, metadata) =
            row.ok_or(BrokerError::NotFound)?;

        let access_token = decode_token(self.vault.open(&access_sealed)?)?;
        let refresh_token = refresh_sealed
            .map(|sealed| self.vault.open(&sealed).and_then(decode_token))
            .transpose()?;

        let expires_at = expires_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| BrokerError::Storage(format!("invalid expires_at: {}", e)))
            })
            .transpose()?;

        let scopes: Vec<String> = serde_json::from_str(&scopes)
            .map_err(|e| BrokerError::Storage(format!("invalid scopes column: {}", e)))?;
        let metadata: serde_json::Value = serde_json::from_str(&metadata)
            .map_err(|e| BrokerError::Storage(format!("invalid metadata column: {}", e)))?;

        Ok(Credentials {
            access_token,
            refresh_token,
            expires_at,
            scopes,
            metadata,
        })
    }

    /// Deletes credentials for a user and provider.
    ///
    /// Returns `true` if a record was removed. Never touches other users'
    /// rows.
    pub fn delete(&self, user_id: &str, provider: Provider) -> Result<bool, BrokerError> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM credentials WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
            )
            .map_err(|e| BrokerError::Storage(format!("failed to delete credentials: {}", e)))?;

        Ok(rows_affected > 0)
    }

    /// Lists all providers with stored credentials for a user.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<Provider>, BrokerError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT provider FROM credentials WHERE user_id = ?1 ORDER BY provider")
            .map_err(|e| BrokerError::Storage(format!("failed to prepare query: {}", e)))?;

        let tags = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))
            .map_err(|e| BrokerError::Storage(format!("failed to list providers: {}", e)))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| BrokerError::Storage(format!("failed to read results: {}", e)))?;

        Ok(tags
            .iter()
            .filter_map(|tag| {
                let provider = Provider::parse(tag);
                if provider.is_none() {
                    warn!(provider = %tag, "Skipping row with unknown provider tag");
                }
                provider
            })
            .collect())
    }
}

fn decode_token(bytes: Vec<u8>) -> Result<String, BrokerError> {
    String::from_utf8(bytes)
        .map_err(|_| BrokerError::Decryption("decrypted token is not valid UTF-8".to_string()))
}
