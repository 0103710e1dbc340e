//! HttpSessionAuthority against an in-process mock of the backend

mod common;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kinderhub_core::{ApiConfig, Credentials, KinderhubError, RefreshPolicy, Registration, Role};
use kinderhub_session::{
    HttpSessionAuthority, MemoryBackend, SessionAuthority, SessionError, SessionPhase, SessionView,
    StorageBackend,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockBackend {
    role: Mutex<String>,
    logouts: AtomicUsize,
    refreshes: AtomicUsize,
}

type Shared = Arc<MockBackend>;

fn user_json(role: &str) -> Value {
    json!({
        "id": "42",
        "email": "parent@example.com",
        "role": role,
        "status": "active",
        "firstName": "Alex",
        "emailVerified": true
    })
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

async fn login(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    if body["password"] != "secret" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Invalid email or password" })),
        )
            .into_response();
    }
    let role = state.role.lock().unwrap().clone();
    Json(json!({
        "accessToken": "access-1",
        "refreshToken": "refresh-1",
        "expiresIn": 3600,
        "user": user_json(&role)
    }))
    .into_response()
}

async fn register() -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "Email is already registered" })),
    )
        .into_response()
}

async fn refresh(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    state.refreshes.fetch_add(1, Ordering::SeqCst);
    if body["refreshToken"] != "refresh-1" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    // No user in the refresh response
    Json(json!({
        "accessToken": "access-2",
        "refreshToken": "refresh-2",
        "expiresIn": 3600
    }))
    .into_response()
}

async fn logout(State(state): State<Shared>, headers: HeaderMap) -> StatusCode {
    if bearer(&headers).is_none() {
        return StatusCode::UNAUTHORIZED;
    }
    state.logouts.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn current_user(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match bearer(&headers) {
        Some("access-1") | Some("access-2") => {}
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    }
    if id != "42" {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "user not found" })))
            .into_response();
    }
    let role = state.role.lock().unwrap().clone();
    Json(user_json(&role)).into_response()
}

async fn spawn_backend() -> (String, Shared) {
    let state: Shared = Arc::new(MockBackend {
        role: Mutex::new("user".to_string()),
        ..Default::default()
    });

    let router = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/register", post(register))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/logout", post(logout))
        .route("/api/users/{id}", get(current_user))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{}/api", addr), state)
}

fn authority_for(base_url: &str) -> HttpSessionAuthority {
    let config = ApiConfig {
        base_url: base_url.to_string(),
        timeout_seconds: 5,
        ..Default::default()
    };
    HttpSessionAuthority::new(&config).unwrap()
}

fn view_for(authority: HttpSessionAuthority) -> SessionView {
    common::init_tracing();
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let authority: Arc<dyn SessionAuthority> = Arc::new(authority);
    SessionView::open(backend, authority, RefreshPolicy::default())
}

fn credentials(password: &str) -> Credentials {
    Credentials {
        email: "parent@example.com".to_string(),
        password: password.to_string(),
    }
}

#[tokio::test]
async fn test_sign_in_and_profile_refresh_over_http() {
    let (base_url, state) = spawn_backend().await;
    let view = view_for(authority_for(&base_url));

    let user = view.accessor.sign_in(&credentials("secret")).await.unwrap();
    assert_eq!(user.id, "42");
    assert!(user.email_verified);

    *state.role.lock().unwrap() = "provider".to_string();
    let phase = view.accessor.refresh_profile().await;

    assert_eq!(phase, SessionPhase::Authenticated);
    assert_eq!(view.accessor.current_user().unwrap().role, Role::Provider);
}

#[tokio::test]
async fn test_unauthorized_sign_in_keeps_server_message() {
    let (base_url, _) = spawn_backend().await;
    let authority = authority_for(&base_url);

    let error = authority.sign_in(&credentials("wrong")).await.unwrap_err();

    match error {
        SessionError::Core(KinderhubError::Authentication { message, .. }) => {
            assert_eq!(message, "Invalid email or password");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_conflict_maps_to_api_error() {
    let (base_url, _) = spawn_backend().await;
    let authority = authority_for(&base_url);

    let error = authority
        .sign_up(&Registration {
            email: "parent@example.com".to_string(),
            password: "secret".to_string(),
            first_name: None,
            last_name: None,
            phone: None,
            role: Role::User,
        })
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        SessionError::Core(KinderhubError::Api { status: 409, ref message, .. })
            if message == "Email is already registered"
    ));
}

#[tokio::test]
async fn test_unknown_user_maps_to_not_found() {
    let (base_url, _) = spawn_backend().await;
    let authority = authority_for(&base_url);

    let error = authority
        .get_current_user("access-1", "7")
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        SessionError::Core(KinderhubError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_token_refresh_keeps_cached_profile() {
    let (base_url, state) = spawn_backend().await;
    let view = view_for(authority_for(&base_url));
    view.accessor.sign_in(&credentials("secret")).await.unwrap();

    let phase = view.accessor.refresh_tokens().await;

    assert_eq!(phase, SessionPhase::Authenticated);
    assert_eq!(state.refreshes.load(Ordering::SeqCst), 1);
    let stored = view.store.read().unwrap();
    assert_eq!(stored.access_token, "access-2");
    assert_eq!(stored.user_id(), Some("42"));
}

#[tokio::test]
async fn test_logout_sends_bearer_token() {
    let (base_url, state) = spawn_backend().await;
    let view = view_for(authority_for(&base_url));
    view.accessor.sign_in(&credentials("secret")).await.unwrap();

    view.accessor.logout().await;

    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
    assert!(view.store.read().is_none());
}

#[tokio::test]
async fn test_unreachable_backend_clears_on_refresh_and_still_logs_out() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let view = view_for(authority_for(&format!("http://{}/api", addr)));
    let cached = kinderhub_core::SessionBundle::new("access-1", "refresh-1", 3600).with_user(
        kinderhub_core::UserProfile::new("42", "parent@example.com", Role::User),
    );

    view.accessor.login(cached.clone()).unwrap();
    assert_eq!(view.accessor.refresh_profile().await, SessionPhase::Anonymous);
    assert!(view.store.read().is_none());

    view.accessor.login(cached).unwrap();
    view.accessor.logout().await;
    assert!(view.store.read().is_none());
    assert!(!view.accessor.is_authenticated());
}
