use anyhow::{Context, Result};
use doki::api::{create_router, AppState};
use doki::broker::CredentialBroker;
use doki::config::Config;
use doki::credentials::{CredentialStore, Vault};
use doki::identity::IdentityClient;
use doki::oauth::{run_state_cleanup, OAuthClient, StateManager};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// How often expired OAuth states are swept (seconds)
const STATE_CLEANUP_INTERVAL_SECONDS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doki=info".into()),
        )
        .init();

    info!("Doki credential broker starting...");

    // Fail fast on missing secrets before binding anything
    let config = Config::from_env().context("configuration error")?;

    let vault = Vault::new(&config.encryption_key).context("invalid encryption key")?;
    let store = Arc::new(
        CredentialStore::new(&config.database_path, vault)
            .context("failed to open credential store")?,
    );

    let oauth = OAuthClient::new(config.google.clone(), config.http_timeout_seconds)?;
    let identity = IdentityClient::new(config.identity.clone(), config.http_timeout_seconds)?;

    let states = StateManager::new(config.state_ttl_seconds);
    tokio::spawn(run_state_cleanup(
        states.clone(),
        STATE_CLEANUP_INTERVAL_SECONDS,
    ));

    let broker = CredentialBroker::new(
        oauth,
        identity.clone(),
        store,
        states,
        config.http_timeout_seconds,
    )?;

    let app = create_router(AppState { broker, identity }).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
