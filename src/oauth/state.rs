//! OAuth state management for CSRF protection.
//!
//! Each authorization URL embeds a unique, unguessable state token. The
//! callback must present the same token; a callback whose state was never
//! issued, was already used, or has expired fails closed.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What an issued state token was bound to at creation time
#[derive(Clone, Debug)]
pub struct StateEntry {
    /// Scopes requested for this authorization flow
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// OAuth state manager with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    expiry_duration: Duration,
}

impl StateManager {
    /// Create a new state manager.
    ///
    /// `expiry_seconds` controls how long issued states remain valid
    /// (default configuration: 600 = 10 minutes).
    pub fn new(expiry_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            expiry_duration: Duration::seconds(expiry_seconds),
        }
    }

    /// Issue a new state token bound to the requested scopes.
    pub fn create(&self, scopes: Vec<String>) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = StateEntry {
            scopes,
            created_at: Utc::now(),
        };

        let mut states = self.states.lock().unwrap();
        states.insert(state.clone(), entry);

        state
    }

    /// Validate and consume a state token.
    ///
    /// Returns the bound entry if the token was issued and has not expired,
    /// `None` otherwise. The token is removed either way (single-use).
    pub fn validate_and_consume(&self, state: &str) -> Option<StateEntry> {
        let mut states = self.states.lock().unwrap();

        let entry = states.remove(state)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }

        Some(entry)
    }

    /// Drop expired entries (called periodically)
    pub fn cleanup_expired(&self) {
        let mut states = self.states.lock().unwrap();
        let now = Utc::now();

        states.retain(|_, entry| now - entry.created_at <= self.expiry_duration);
    }

    /// Count of outstanding states (for monitoring)
    pub fn count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        manager.cleanup_expired();
        tracing::debug!(
            remaining = manager.count(),
            "OAuth state cleanup complete"
        );
    }
}
