//! REST surface: maps routes onto dotted API methods and wraps the JSON
//! envelope in HTTP status codes.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use governor::{Quota, RateLimiter};
use serde_json::{Map, Value};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::api::error::{err, http_status};
use crate::api::{self, AppState, Request};

type Params = HashMap<String, String>;

/// Global rate limiter (direct quota, not keyed per client).
type GlobalRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Clone)]
pub struct AppHandle {
    state: Arc<Mutex<AppState>>,
    limiter: Option<Arc<GlobalRateLimiter>>,
}

impl AppHandle {
    pub fn new(state: AppState, rate_limit_per_minute: u32) -> Self {
        let limiter = NonZeroU32::new(rate_limit_per_minute)
            .map(|n| Arc::new(RateLimiter::direct(Quota::per_minute(n))));
        Self {
            state: Arc::new(Mutex::new(state)),
            limiter,
        }
    }
}

/// Token after a case-insensitive `Bearer` scheme.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn parse_body(body: &[u8]) -> Result<Map<String, Value>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(m)) => Ok(m),
        Ok(_) => Err("request body must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON body: {}", e)),
    }
}

fn creates(method: &str) -> bool {
    method.ends_with(".create")
        || matches!(method, "auth.register" | "calls.start" | "chats.send")
}

fn envelope(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

/// Error envelope whose HTTP status follows from `code`.
fn rejected(code: &str, message: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(http_status(code)).unwrap_or(StatusCode::BAD_REQUEST);
    envelope(status, err(code, message, None))
}

/// Status for a handler response: the error code decides failures, creates
/// answer 201.
fn status_for(method: &str, resp: &Value) -> StatusCode {
    if resp.get("status").and_then(Value::as_str) == Some("error") {
        let code = resp.get("code").and_then(Value::as_str).unwrap_or("internal");
        return StatusCode::from_u16(http_status(code)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    }
    if creates(method) {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

async fn dispatch(
    app: AppHandle,
    method: &'static str,
    headers: HeaderMap,
    query: Result<Query<Params>, QueryRejection>,
    path: Result<Params, PathRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let query = match query {
        Ok(Query(q)) => q,
        Err(e) => return rejected("bad_params", e.body_text()),
    };
    let path = match path {
        Ok(p) => p,
        Err(e) => return rejected("bad_params", e.body_text()),
    };
    let body = match body {
        Ok(b) => b,
        Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return rejected("payload_too_large", e.body_text())
        }
        Err(e) => return rejected("bad_json", e.body_text()),
    };

    let mut params = match parse_body(&body) {
        Ok(p) => p,
        Err(msg) => return rejected("bad_json", msg),
    };
    // Body wins over query; path parameters win over both.
    for (k, v) in query {
        params.entry(k).or_insert(Value::String(v));
    }
    for (k, v) in path {
        params.insert(k, Value::String(v));
    }

    let mut req = Request::new(method, Value::Object(params));
    req.bearer = bearer_token(&headers);
    let request_id = req.id.clone();

    // rusqlite connections are blocking; keep them off the async workers.
    let state = app.state.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut guard = match state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                // A handler panicked mid-request; SQLite rolled back its
                // statement, so the state is still usable.
                warn!("application state lock was poisoned, recovering");
                state.clear_poison();
                poisoned.into_inner()
            }
        };
        api::handle_request(&mut guard, req)
    })
    .await;
    let resp = match joined {
        Ok(v) => v,
        Err(e) => {
            error!(request_id = %request_id, method, error = %e, "handler task failed");
            err("internal", "request handler failed", None)
        }
    };

    let status = status_for(method, &resp);
    if status.is_server_error() {
        let code = resp.get("code").and_then(|v| v.as_str()).unwrap_or_default();
        let message = resp.get("message").and_then(|v| v.as_str()).unwrap_or_default();
        error!(request_id = %request_id, method, code, reason = message, "request failed");
    }
    envelope(status, resp)
}

/// Handler for a route without path parameters.
macro_rules! op {
    ($method:literal) => {
        |State(app): State<AppHandle>,
         headers: HeaderMap,
         query: Result<Query<Params>, QueryRejection>,
         body: Result<Bytes, BytesRejection>| async move {
            dispatch(app, $method, headers, query, Ok(Params::new()), body).await
        }
    };
}

/// Handler for a route whose path parameters become request params.
macro_rules! op_path {
    ($method:literal) => {
        |State(app): State<AppHandle>,
         headers: HeaderMap,
         path: Result<Path<Params>, PathRejection>,
         query: Result<Query<Params>, QueryRejection>,
         body: Result<Bytes, BytesRejection>| async move {
            dispatch(app, $method, headers, query, path.map(|Path(p)| p), body).await
        }
    };
}

async fn rate_limit(
    State(app): State<AppHandle>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &app.limiter {
        if limiter.check().is_err() {
            warn!(path = %request.uri().path(), "rate limit exceeded");
            return envelope(
                StatusCode::TOO_MANY_REQUESTS,
                err("rate_limited", "too many requests, retry shortly", None),
            );
        }
    }
    next.run(request).await
}

async fn fallback(method: Method, uri: axum::http::Uri) -> Response {
    rejected(
        "not_implemented",
        format!("no route for {} {}", method, uri.path()),
    )
}

async fn method_not_allowed(method: Method, uri: axum::http::Uri) -> Response {
    rejected(
        "method_not_allowed",
        format!("{} is not supported on {}", method, uri.path()),
    )
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let listed: Vec<HeaderValue> = origins
        .iter()
        .map(|o| o.trim())
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if listed.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(listed))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
}

pub fn router(app: AppHandle, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/health", get(op!("health")))
        // Accounts
        .route("/api/auth/register", post(op!("auth.register")))
        .route("/api/auth/login", post(op!("auth.login")))
        .route("/api/auth/me", get(op!("auth.me")))
        .route("/api/auth/password", post(op!("auth.changePassword")))
        .route("/api/users", get(op!("users.list")))
        .route(
            "/api/users/{id}",
            put(op_path!("users.update")).delete(op_path!("users.delete")),
        )
        .route("/api/profile/me", get(op!("profile.me")))
        .route("/api/dashboard", get(op!("dashboard.summary")))
        .route(
            "/api/settings/school",
            get(op!("settings.school.get")).put(op!("settings.school.update")),
        )
        // Classes
        .route("/api/classes", get(op!("classes.list")).post(op!("classes.create")))
        .route(
            "/api/classes/{id}",
            get(op_path!("classes.get"))
                .put(op_path!("classes.update"))
                .delete(op_path!("classes.delete")),
        )
        .route(
            "/api/classes/{id}/sections",
            get(op_path!("sections.list")).post(op_path!("sections.create")),
        )
        .route(
            "/api/sections/{id}",
            put(op_path!("sections.update")).delete(op_path!("sections.delete")),
        )
        // People
        .route("/api/students", get(op!("students.list")).post(op!("students.create")))
        .route(
            "/api/students/{id}",
            get(op_path!("students.get"))
                .put(op_path!("students.update"))
                .delete(op_path!("students.delete")),
        )
        .route("/api/staff", get(op!("staff.list")).post(op!("staff.create")))
        .route(
            "/api/staff/{id}",
            get(op_path!("staff.get"))
                .put(op_path!("staff.update"))
                .delete(op_path!("staff.delete")),
        )
        .route("/api/teachers", get(op!("teachers.list")).post(op!("teachers.create")))
        .route(
            "/api/teachers/{id}",
            get(op_path!("teachers.get"))
                .put(op_path!("teachers.update"))
                .delete(op_path!("teachers.delete")),
        )
        .route("/api/teachers/{id}/schedule", get(op_path!("teachers.schedule")))
        .route("/api/parents", get(op!("parents.list")).post(op!("parents.create")))
        .route("/api/parents/me", get(op!("parents.me")))
        .route(
            "/api/parents/{id}",
            get(op_path!("parents.get"))
                .put(op_path!("parents.update"))
                .delete(op_path!("parents.delete")),
        )
        .route("/api/parents/{id}/students", post(op_path!("parents.linkStudent")))
        .route(
            "/api/parents/{id}/students/{studentId}",
            delete(op_path!("parents.unlinkStudent")),
        )
        .route("/api/guardians", get(op!("guardians.list")).post(op!("guardians.create")))
        .route("/api/guardians/me", get(op!("guardians.me")))
        .route(
            "/api/guardians/{id}",
            get(op_path!("guardians.get"))
                .put(op_path!("guardians.update"))
                .delete(op_path!("guardians.delete")),
        )
        .route("/api/guardians/{id}/students", post(op_path!("guardians.linkStudent")))
        .route(
            "/api/guardians/{id}/students/{studentId}",
            delete(op_path!("guardians.unlinkStudent")),
        )
        // Timetable and leave
        .route("/api/schedules", get(op!("schedules.list")).post(op!("schedules.create")))
        .route(
            "/api/schedules/{id}",
            put(op_path!("schedules.update")).delete(op_path!("schedules.delete")),
        )
        .route(
            "/api/leave-applications",
            get(op!("leaves.list")).post(op!("leaves.create")),
        )
        .route(
            "/api/leave-applications/{id}",
            get(op_path!("leaves.get")).delete(op_path!("leaves.delete")),
        )
        .route("/api/leave-applications/{id}/status", put(op_path!("leaves.review")))
        .route("/api/leave-applications/{id}/cancel", post(op_path!("leaves.cancel")))
        // Communication
        .route("/api/notices", get(op!("notices.list")).post(op!("notices.create")))
        .route(
            "/api/notices/{id}",
            get(op_path!("notices.get"))
                .put(op_path!("notices.update"))
                .delete(op_path!("notices.delete")),
        )
        .route("/api/chats", get(op!("chats.list")))
        .route("/api/chats/messages", post(op!("chats.send")))
        .route("/api/chats/{id}/messages", get(op_path!("chats.messages")))
        .route("/api/chats/{id}/read", post(op_path!("chats.markRead")))
        .route("/api/calls", get(op!("calls.list")).post(op!("calls.start")))
        .route("/api/calls/{id}", put(op_path!("calls.update")))
        .route("/api/todos", get(op!("todos.list")).post(op!("todos.create")))
        .route(
            "/api/todos/{id}",
            put(op_path!("todos.update")).delete(op_path!("todos.delete")),
        )
        .fallback(fallback)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(middleware::from_fn_with_state(app.clone(), rate_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origins)),
        )
        .with_state(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("bEaReR abc.def"));
        assert_eq!(bearer_token(&h).as_deref(), Some("abc.def"));
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&h), None);
    }

    #[test]
    fn body_must_be_an_object() {
        assert!(parse_body(b"").expect("empty").is_empty());
        assert!(parse_body(b"[1]").is_err());
        assert!(parse_body(b"{bad").is_err());
    }

    #[test]
    fn rejections_keep_the_envelope_status() {
        assert_eq!(rejected("bad_params", "x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            rejected("payload_too_large", "x").status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            rejected("method_not_allowed", "x").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn poisoned_state_lock_keeps_serving() {
        let state = AppState {
            db: crate::db::open_in_memory().expect("db"),
            keys: crate::auth::TokenKeys::new("unit-test-secret-0123", 3600).expect("keys"),
            email_domain: "school.local".to_string(),
            password_rounds: 1_000,
        };
        let app = AppHandle::new(state, 0);
        let shared = app.state.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.lock().expect("lock");
            panic!("handler panicked while holding the state");
        })
        .join();
        assert!(app.state.is_poisoned());

        let server = axum_test::TestServer::new(router(app.clone(), &[])).expect("server");
        let first = server.get("/api/health").await;
        assert_eq!(first.status_code(), StatusCode::OK);
        assert!(!app.state.is_poisoned());
        let second = server.get("/api/health").await;
        assert_eq!(second.status_code(), StatusCode::OK);
    }

    #[test]
    fn creates_answer_201() {
        let okv = serde_json::json!({ "status": "success" });
        assert_eq!(status_for("students.create", &okv), StatusCode::CREATED);
        assert_eq!(status_for("students.list", &okv), StatusCode::OK);
        let e = err("conflict", "x", None);
        assert_eq!(status_for("students.create", &e), StatusCode::CONFLICT);
    }
}
