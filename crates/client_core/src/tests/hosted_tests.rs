use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::{DateTime, Duration};
use serde_json::json;
use tokio::{net::TcpListener, sync::Mutex as AsyncMutex};

use super::*;
use crate::test_support::session_for;

const ANON_KEY: &str = "anon-key";

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    query: Option<String>,
    authorization: Option<String>,
    apikey: Option<String>,
    prefer: Option<String>,
    body: Value,
}

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<AsyncMutex<Vec<Recorded>>>,
}

fn token_body(access_token: &str, refresh_token: &str) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600,
        "expires_at": 1_893_456_000,
        "refresh_token": refresh_token,
        "user": { "id": "1", "email": "a@b.com" },
    })
}

fn token_response(query: &str, body: &Value) -> (StatusCode, Value) {
    if query.contains("grant_type=password") {
        if body["email"] == "a@b.com" && body["password"] == "pw" {
            return (StatusCode::OK, token_body("token-1", "refresh-1"));
        }
        return (
            StatusCode::BAD_REQUEST,
            json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials",
            }),
        );
    }
    if query.contains("grant_type=refresh_token") && body["refresh_token"] == "refresh-1" {
        return (StatusCode::OK, token_body("token-refreshed", "refresh-2"));
    }
    (
        StatusCode::BAD_REQUEST,
        json!({ "error_description": "Invalid Refresh Token" }),
    )
}

fn sign_up_response(body: &Value) -> (StatusCode, Value) {
    match body["email"].as_str() {
        Some("new@b.com") => {
            let mut token = token_body("token-2", "refresh-2");
            token["user"] = json!({ "id": "2", "email": "new@b.com" });
            (StatusCode::OK, token)
        }
        Some("pending@b.com") => (
            StatusCode::OK,
            json!({
                "id": "3",
                "email": "pending@b.com",
                "confirmation_sent_at": "2024-01-01T00:00:00Z",
            }),
        ),
        _ => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "code": 422, "message": "", "msg": "User already registered" }),
        ),
    }
}

async fn handle(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let query = uri.query().unwrap_or_default().to_string();
    state.requests.lock().await.push(Recorded {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        authorization: header("authorization"),
        apikey: header("apikey"),
        prefer: header("prefer"),
        body: body.clone(),
    });

    let (status, payload) = match (method.as_str(), uri.path()) {
        ("POST", "/auth/v1/token") => token_response(&query, &body),
        ("POST", "/auth/v1/signup") => sign_up_response(&body),
        ("POST", "/auth/v1/logout") => (StatusCode::NO_CONTENT, Value::Null),
        ("POST", "/rest/v1/entries") => (StatusCode::CREATED, Value::Null),
        ("PATCH", "/rest/v1/entries") => (
            StatusCode::BAD_REQUEST,
            json!({
                "code": "23514",
                "details": null,
                "hint": null,
                "message": "constraint violated",
            }),
        ),
        ("GET", "/rest/v1/entries") => (
            StatusCode::OK,
            json!([{
                "id": 4,
                "description": "Rent",
                "amount": 1500.0,
                "date": "2023-02-15",
                "type": "expense",
                "category": "Housing",
            }]),
        ),
        ("POST", "/rest/v1/broken") => (StatusCode::INTERNAL_SERVER_ERROR, Value::Null),
        _ => (StatusCode::NOT_FOUND, json!({ "message": "no route" })),
    };

    if payload.is_null() {
        status.into_response()
    } else {
        (status, Json(payload)).into_response()
    }
}

async fn spawn_backend() -> (HostedBackend, MockState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = MockState::default();
    let app = Router::new().fallback(handle).with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let base_url = Url::parse(&format!("http://{addr}/")).expect("url");
    (
        HostedBackend::with_client(Client::new(), base_url, ANON_KEY),
        state,
    )
}

async fn recorded(state: &MockState) -> Vec<Recorded> {
    state.requests.lock().await.clone()
}

#[tokio::test]
async fn password_grant_builds_session_and_announces_sign_in() {
    let (backend, state) = spawn_backend().await;
    let mut events = backend.subscribe();

    let session = backend
        .exchange_credentials("a@b.com", "pw")
        .await
        .expect("sign in");

    assert_eq!(session.access_token, "token-1");
    assert_eq!(session.user.id, "1");
    assert_eq!(session.user.email.as_deref(), Some("a@b.com"));
    assert_eq!(
        session.expires_at,
        DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    );
    assert_eq!(backend.current_session(), Some(session.clone()));

    let initial = events.next().await.expect("initial event");
    assert_eq!(initial, AuthEvent::new(AuthEventKind::InitialSession, None));
    let signed_in = events.next().await.expect("sign-in event");
    assert_eq!(
        signed_in,
        AuthEvent::new(AuthEventKind::SignedIn, Some(session))
    );

    let requests = recorded(&state).await;
    assert_eq!(requests[0].query.as_deref(), Some("grant_type=password"));
    assert_eq!(requests[0].apikey.as_deref(), Some(ANON_KEY));
    assert_eq!(
        requests[0].body,
        json!({ "email": "a@b.com", "password": "pw" })
    );
}

#[tokio::test]
async fn rejected_credentials_pass_the_message_through() {
    let (backend, _state) = spawn_backend().await;

    let err = backend
        .exchange_credentials("a@b.com", "wrong")
        .await
        .expect_err("must fail");

    assert_eq!(err.user_message(), "Invalid login credentials");
    assert_eq!(err.status(), Some(400));
    assert!(backend.current_session().is_none());
}

#[tokio::test]
async fn subscribe_starts_with_the_held_session() {
    let (backend, _state) = spawn_backend().await;
    backend
        .exchange_credentials("a@b.com", "pw")
        .await
        .expect("sign in");

    let mut events = backend.subscribe();
    let initial = events.next().await.expect("initial");

    assert_eq!(initial.kind, AuthEventKind::InitialSession);
    assert_eq!(initial.session, backend.current_session());
}

#[tokio::test]
async fn sign_out_revokes_with_bearer_and_clears() {
    let (backend, state) = spawn_backend().await;
    backend
        .exchange_credentials("a@b.com", "pw")
        .await
        .expect("sign in");
    let mut events = backend.subscribe();
    events.next().await.expect("initial");

    backend.sign_out().await.expect("sign out");

    assert!(backend.current_session().is_none());
    let event = events.next().await.expect("sign-out event");
    assert_eq!(event, AuthEvent::new(AuthEventKind::SignedOut, None));
    let logout = recorded(&state)
        .await
        .into_iter()
        .find(|request| request.path == "/auth/v1/logout")
        .expect("logout request");
    assert_eq!(logout.authorization.as_deref(), Some("Bearer token-1"));
}

#[tokio::test]
async fn sign_out_without_session_skips_the_remote_call() {
    let (backend, state) = spawn_backend().await;

    backend.sign_out().await.expect("sign out");

    assert!(recorded(&state).await.is_empty());
}

#[tokio::test]
async fn expired_session_is_refreshed_on_fetch() {
    let (backend, state) = spawn_backend().await;
    let mut stale = session_for("1", "a@b.com");
    stale.expires_at = Utc::now() - Duration::minutes(5);
    *backend.held() = Some(stale);
    let mut events = backend.subscribe();
    events.next().await.expect("initial");

    let fetched = backend
        .fetch_current_session()
        .await
        .expect("fetch")
        .expect("session");

    assert_eq!(fetched.access_token, "token-refreshed");
    assert_eq!(fetched.refresh_token.as_deref(), Some("refresh-2"));
    let event = events.next().await.expect("refresh event");
    assert_eq!(event.kind, AuthEventKind::TokenRefreshed);
    let requests = recorded(&state).await;
    assert_eq!(requests[0].query.as_deref(), Some("grant_type=refresh_token"));
}

#[tokio::test]
async fn rejected_refresh_drops_the_held_session() {
    let (backend, _state) = spawn_backend().await;
    let mut stale = session_for("1", "a@b.com");
    stale.expires_at = Utc::now() - Duration::minutes(5);
    stale.refresh_token = Some("revoked".into());
    *backend.held() = Some(stale);

    let fetched = backend.fetch_current_session().await.expect("fetch");

    assert!(fetched.is_none());
    assert!(backend.current_session().is_none());
}

#[tokio::test]
async fn insert_posts_content_with_session_bearer() {
    let (backend, state) = spawn_backend().await;
    backend
        .exchange_credentials("a@b.com", "pw")
        .await
        .expect("sign in");
    let fields = match json!({ "description": "Rent", "amount": 1500.0 }) {
        Value::Object(fields) => fields,
        _ => unreachable!(),
    };

    backend.insert("entries", fields).await.expect("insert");

    let insert = recorded(&state)
        .await
        .into_iter()
        .find(|request| request.path == "/rest/v1/entries")
        .expect("insert request");
    assert_eq!(insert.method, "POST");
    assert_eq!(insert.authorization.as_deref(), Some("Bearer token-1"));
    assert_eq!(insert.prefer.as_deref(), Some("return=minimal"));
    assert_eq!(insert.body, json!({ "description": "Rent", "amount": 1500.0 }));
}

#[tokio::test]
async fn update_filters_by_key_and_surfaces_rejection() {
    let (backend, state) = spawn_backend().await;

    let err = backend
        .update("entries", RowFields::new(), "id", 1)
        .await
        .expect_err("rejected");

    assert_eq!(err.user_message(), "constraint violated");
    let requests = recorded(&state).await;
    assert_eq!(requests[0].method, "PATCH");
    assert_eq!(requests[0].query.as_deref(), Some("id=eq.1"));
    assert_eq!(
        requests[0].authorization.as_deref(),
        Some("Bearer anon-key")
    );
}

#[tokio::test]
async fn bodyless_failure_falls_back_to_status_text() {
    let (backend, _state) = spawn_backend().await;

    let err = backend
        .insert("broken", RowFields::new())
        .await
        .expect_err("rejected");

    assert_eq!(err.user_message(), "Internal Server Error");
    assert_eq!(err.status(), Some(500));
}

#[tokio::test]
async fn select_returns_rows_in_requested_order() {
    let (backend, state) = spawn_backend().await;

    let rows = backend
        .select("entries", Some("date.desc"))
        .await
        .expect("select");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["description"], "Rent");
    let requests = recorded(&state).await;
    assert_eq!(
        requests[0].query.as_deref(),
        Some("select=*&order=date.desc")
    );
}

#[tokio::test]
async fn sign_up_with_issued_session_holds_it_and_announces_sign_in() {
    let (backend, state) = spawn_backend().await;
    let mut events = backend.subscribe();
    events.next().await.expect("initial");

    let session = backend
        .sign_up("new@b.com", "pw")
        .await
        .expect("sign up")
        .expect("session");

    assert_eq!(session.user.id, "2");
    assert_eq!(backend.current_session(), Some(session.clone()));
    let event = events.next().await.expect("sign-in event");
    assert_eq!(event, AuthEvent::new(AuthEventKind::SignedIn, Some(session)));
    let requests = recorded(&state).await;
    assert_eq!(requests[0].path, "/auth/v1/signup");
    assert_eq!(requests[0].apikey.as_deref(), Some(ANON_KEY));
    assert_eq!(
        requests[0].body,
        json!({ "email": "new@b.com", "password": "pw" })
    );
}

#[tokio::test]
async fn sign_up_pending_confirmation_holds_nothing() {
    let (backend, _state) = spawn_backend().await;

    let session = backend.sign_up("pending@b.com", "pw").await.expect("sign up");

    assert!(session.is_none());
    assert!(backend.current_session().is_none());
}

#[tokio::test]
async fn rejected_sign_up_skips_empty_message_fields() {
    let (backend, _state) = spawn_backend().await;

    let err = backend
        .sign_up("a@b.com", "pw")
        .await
        .expect_err("already registered");

    assert_eq!(err.user_message(), "User already registered");
    assert_eq!(err.status(), Some(422));
}
