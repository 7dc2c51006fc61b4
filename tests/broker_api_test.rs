// Integration tests for the credential broker HTTP surface

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use doki::api::{create_router, AppState};
use doki::broker::CredentialBroker;
use doki::config::{GoogleOAuthConfig, IdentityConfig};
use doki::credentials::{CredentialStore, Vault};
use doki::identity::IdentityClient;
use doki::oauth::{OAuthClient, StateManager};
use std::sync::Arc;
use tower::ServiceExt;

/// Build the full app with the OAuth token endpoint at `{base}/oauth/token`
/// and the identity provider at `{base}/auth/v1/...`, both served by a
/// mockito server.
fn create_test_app(base_url: &str) -> Router {
    let vault = Vault::new(&BASE64.encode([0u8; 32])).unwrap();
    let store = Arc::new(CredentialStore::new(":memory:", vault).unwrap());

    let oauth = OAuthClient::new(
        GoogleOAuthConfig {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: format!("{}/oauth/token", base_url),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            redirect_uri: "http://localhost:8080/api/oauth/google/callback".to_string(),
        },
        5,
    )
    .unwrap();
    let identity = IdentityClient::new(
        IdentityConfig {
            base_url: base_url.to_string(),
            service_key: "service-key".to_string(),
        },
        5,
    )
    .unwrap();

    let broker = CredentialBroker::new(
        oauth,
        identity.clone(),
        store,
        StateManager::new(600),
        5,
    )
    .unwrap();

    create_router(AppState { broker, identity })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Pull the `state` query parameter out of the consent redirect URL
fn extract_state(location: &str) -> String {
    let query = location.split_once('?').unwrap().1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("state="))
        .map(|v| urlencoding::decode(v).unwrap().into_owned())
        .expect("no state in consent URL")
}

const SESSION_BODY: &str = r#"{
    "access_token": "session-access",
    "refresh_token": "session-refresh",
    "user": { "id": "user-uuid-1", "email": "alice@example.com" }
}"#;

#[tokio::test]
async fn test_oauth_connect_flow_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let _token = server
        .mock("POST", "/oauth/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "access_token": "ya29.fresh",
                "refresh_token": "1//refresh",
                "id_token": "header.payload.sig",
                "expires_in": 3600,
                "scope": "openid email profile https://www.googleapis.com/auth/spreadsheets.readonly"
            }"#,
        )
        .create_async()
        .await;
    let _bridge = server
        .mock("POST", "/auth/v1/token?grant_type=id_token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(SESSION_BODY)
        .create_async()
        .await;

    let app = create_test_app(&server.url());

    // Step 1: start redirects to the consent URL with a fresh state
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/oauth/google/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("https://accounts.google.com/"));
    let state = extract_state(&location);

    // Step 2: provider redirects back with code + state
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/api/oauth/google/callback?code=auth-code&state={}",
                    state
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["connection_status"], "connected");
    assert_eq!(json["session"]["user_id"], "user-uuid-1");
    assert_eq!(json["session"]["access_token"], "session-access");
}

#[tokio::test]
async fn test_callback_with_unknown_state_is_unauthorized() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server.url());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/oauth/google/callback?code=auth-code&state=never-issued")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["kind"], "state_mismatch");
}

#[tokio::test]
async fn test_callback_with_provider_error_is_user_facing() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server.url());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/oauth/google/callback?error=access_denied")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // User-facing: restarting the consent flow resolves it
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["kind"], "exchange_error");
}

#[tokio::test]
async fn test_callback_with_rejected_code_is_bad_request() {
    let mut server = mockito::Server::new_async().await;
    let _token = server
        .mock("POST", "/oauth/token")
        .with_status(400)
        .with_body(r#"{"error": "invalid_grant"}"#)
        .create_async()
        .await;

    let app = create_test_app(&server.url());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/oauth/google/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let state = extract_state(&location);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/api/oauth/google/callback?code=stale-code&state={}",
                    state
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["kind"], "exchange_error");
}

#[tokio::test]
async fn test_connections_require_bearer_token() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server.url());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/connections")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["kind"], "unauthenticated");
}

#[tokio::test]
async fn test_database_connection_lifecycle() {
    let mut server = mockito::Server::new_async().await;
    let _user = server
        .mock("GET", "/auth/v1/user")
        .match_header("authorization", "Bearer alice-session")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "alice-uuid", "email": "alice@example.com"}"#)
        .expect_at_least(1)
        .create_async()
        .await;
    let _probe = server
        .mock("GET", "/rest/v1/")
        .match_header("apikey", "alice-service-key")
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let app = create_test_app(&server.url());
    let project_url = server.url();

    // Connect the service key (probe passes)
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/connections/database")
                .header("authorization", "Bearer alice-session")
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    r#"{{"project_url": "{}", "service_key": "alice-service-key"}}"#,
                    project_url
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The connection shows up in the listing
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/connections")
                .header("authorization", "Bearer alice-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["connections"], serde_json::json!(["external-database"]));

    // The decrypted key comes back for use
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/connections/external-database/token")
                .header("authorization", "Bearer alice-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["access_token"], "alice-service-key");
    assert_eq!(json["metadata"]["project_url"], project_url);

    // Disconnect removes it
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/connections/external-database")
                .header("authorization", "Bearer alice-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/connections/external-database/token")
                .header("authorization", "Bearer alice-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rejected_service_key_is_never_stored() {
    let mut server = mockito::Server::new_async().await;
    let _user = server
        .mock("GET", "/auth/v1/user")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "alice-uuid", "email": "alice@example.com"}"#)
        .expect_at_least(1)
        .create_async()
        .await;
    let _probe = server
        .mock("GET", "/rest/v1/")
        .with_status(403)
        .create_async()
        .await;

    let app = create_test_app(&server.url());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/connections/database")
                .header("authorization", "Bearer alice-session")
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    r#"{{"project_url": "{}", "service_key": "bad-key"}}"#,
                    server.url()
                )))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["kind"], "probe_auth_error");

    // Nothing persisted
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/connections/external-database/token")
                .header("authorization", "Bearer alice-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_users_never_see_each_others_credentials() {
    let mut server = mockito::Server::new_async().await;
    let _alice = server
        .mock("GET", "/auth/v1/user")
        .match_header("authorization", "Bearer alice-session")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "alice-uuid", "email": "alice@example.com"}"#)
        .expect_at_least(1)
        .create_async()
        .await;
    let _bob = server
        .mock("GET", "/auth/v1/user")
        .match_header("authorization", "Bearer bob-session")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "bob-uuid", "email": "bob@example.com"}"#)
        .expect_at_least(1)
        .create_async()
        .await;
    let _probe = server
        .mock("GET", "/rest/v1/")
        .with_status(200)
        .with_body("[]")
        .expect_at_least(2)
        .create_async()
        .await;

    let app = create_test_app(&server.url());

    for (bearer, key) in [
        ("alice-session", "alice-service-key"),
        ("bob-session", "bob-service-key"),
    ] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/connections/database")
                    .header("authorization", format!("Bearer {}", bearer))
                    .header("content-type", "application/json")
                    .body(Body::from(format!(
                        r#"{{"project_url": "{}", "service_key": "{}"}}"#,
                        server.url(),
                        key
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Each caller only ever receives their own secret
    for (bearer, expected) in [
        ("alice-session", "alice-service-key"),
        ("bob-session", "bob-service-key"),
    ] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/connections/external-database/token")
                    .header("authorization", format!("Bearer {}", bearer))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["access_token"], expected);
    }
}

#[tokio::test]
async fn test_sign_in_passthrough() {
    let mut server = mockito::Server::new_async().await;
    let _signin = server
        .mock("POST", "/auth/v1/token?grant_type=password")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(SESSION_BODY)
        .create_async()
        .await;

    let app = create_test_app(&server.url());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/signin")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"email": "alice@example.com", "password": "secret"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["session"]["user_id"], "user-uuid-1");
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server.url());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/connections/github/token")
                .header("authorization", "Bearer alice-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
