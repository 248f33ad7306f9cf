#![allow(dead_code)]

use schoold::api::{self, AppState, Request};
use schoold::auth::TokenKeys;
use schoold::db;
use serde_json::{json, Value};

pub const EMAIL_DOMAIN: &str = "school.local";
pub const PASSWORD: &str = "secret-pass";

pub fn app_state() -> AppState {
    AppState {
        db: db::open_in_memory().expect("open in-memory db"),
        keys: TokenKeys::new("integration-test-secret-0123", 3600).expect("token keys"),
        email_domain: EMAIL_DOMAIN.to_string(),
        // Low iteration count keeps debug-build tests quick.
        password_rounds: 1_000,
    }
}

pub fn request(state: &mut AppState, token: Option<&str>, method: &str, params: Value) -> Value {
    let mut req = Request::new(method, params);
    if let Some(t) = token {
        req = req.with_bearer(t);
    }
    api::handle_request(state, req)
}

/// `data` of a successful response; panics with the envelope otherwise.
pub fn request_ok(state: &mut AppState, token: &str, method: &str, params: Value) -> Value {
    let value = request(state, Some(token), method, params);
    assert_eq!(
        value.get("status").and_then(|v| v.as_str()),
        Some("success"),
        "{} failed: {}",
        method,
        value
    );
    value.get("data").cloned().unwrap_or(Value::Null)
}

/// Asserts the error `code` and returns the envelope.
pub fn request_err(
    state: &mut AppState,
    token: Option<&str>,
    method: &str,
    params: Value,
    code: &str,
) -> Value {
    let value = request(state, token, method, params);
    assert_eq!(
        value.get("status").and_then(|v| v.as_str()),
        Some("error"),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    assert_eq!(
        value.get("code").and_then(|v| v.as_str()),
        Some(code),
        "{} wrong error code: {}",
        method,
        value
    );
    value
}

pub fn login(state: &mut AppState, username: &str, password: &str) -> String {
    let value = request(
        state,
        None,
        "auth.login",
        json!({ "username": username, "password": password }),
    );
    value["data"]["token"]
        .as_str()
        .unwrap_or_else(|| panic!("login failed for {}: {}", username, value))
        .to_string()
}

/// Registers the first account (always admin) and returns its token.
pub fn bootstrap_admin(state: &mut AppState) -> String {
    let value = request(
        state,
        None,
        "auth.register",
        json!({ "username": "principal", "password": PASSWORD, "email": "principal@school.local" }),
    );
    assert_eq!(value["status"], "success", "bootstrap failed: {}", value);
    login(state, "principal", PASSWORD)
}

pub struct Account {
    pub id: String,
    pub token: String,
}

pub fn create_account(
    state: &mut AppState,
    admin: &str,
    username: &str,
    role: &str,
    extra: Value,
) -> Account {
    let mut params = json!({ "username": username, "password": PASSWORD, "role": role });
    if let (Some(dst), Some(src)) = (params.as_object_mut(), extra.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    let user = request_ok(state, admin, "auth.register", params);
    Account {
        id: id_of(&user),
        token: login(state, username, PASSWORD),
    }
}

pub fn id_of(v: &Value) -> String {
    v["id"].as_str().expect("id").to_string()
}

pub fn create_class(state: &mut AppState, admin: &str, name: &str) -> String {
    id_of(&request_ok(
        state,
        admin,
        "classes.create",
        json!({ "name": name, "gradeLevel": 5 }),
    ))
}

pub fn create_student(
    state: &mut AppState,
    admin: &str,
    admission_no: &str,
    first: &str,
    extra: Value,
) -> String {
    let mut params = json!({
        "admissionNo": admission_no,
        "firstName": first,
        "lastName": "Okafor"
    });
    if let (Some(dst), Some(src)) = (params.as_object_mut(), extra.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    id_of(&request_ok(state, admin, "students.create", params))
}
