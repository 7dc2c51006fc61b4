// HTTP API surface
pub mod api;

// Bearer-token extraction
pub mod auth;

// Connect/retrieve/disconnect orchestration
pub mod broker;

// Environment-driven configuration
pub mod config;

// Vault and encrypted credential store
pub mod credentials;

// Error taxonomy
pub mod error;

// Identity provider client and bridge
pub mod identity;

// OAuth exchange client and CSRF state
pub mod oauth;
