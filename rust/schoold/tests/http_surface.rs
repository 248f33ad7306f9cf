mod test_support;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};

use schoold::http::{router, AppHandle};
use test_support::{app_state, PASSWORD};

fn server(rate_limit_per_minute: u32) -> TestServer {
    let app = AppHandle::new(app_state(), rate_limit_per_minute);
    TestServer::new(router(app, &[])).expect("test server")
}

async fn admin_token(server: &TestServer) -> String {
    let registered = server
        .post("/api/auth/register")
        .json(&json!({ "username": "principal", "password": PASSWORD }))
        .await;
    assert_eq!(registered.status_code(), StatusCode::CREATED);

    let login = server
        .post("/api/auth/login")
        .json(&json!({ "username": "principal", "password": PASSWORD }))
        .await;
    assert_eq!(login.status_code(), StatusCode::OK);
    let body: Value = login.json();
    body["data"]["token"].as_str().expect("token").to_string()
}

#[tokio::test]
async fn health_answers_without_a_token() {
    let server = server(0);
    let response = server.get("/api/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["database"], "ok");
}

#[tokio::test]
async fn error_codes_map_to_http_statuses() {
    let server = server(0);

    let anonymous = server.get("/api/students").await;
    assert_eq!(anonymous.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = anonymous.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "unauthorized");
    assert!(body["data"].is_null());

    let token = admin_token(&server).await;

    let bad_json = server
        .post("/api/classes")
        .authorization_bearer(&token)
        .text("{ not json")
        .await;
    assert_eq!(bad_json.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = bad_json.json();
    assert_eq!(body["code"], "bad_json");

    let missing = server
        .get("/api/classes/does-not-exist")
        .authorization_bearer(&token)
        .await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

    let unknown = server.get("/api/grades").authorization_bearer(&token).await;
    assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
    let body: Value = unknown.json();
    assert_eq!(body["code"], "not_implemented");
}

#[tokio::test]
async fn framework_rejections_keep_the_envelope() {
    let server = server(0);

    let wrong_method = server.delete("/api/health").await;
    assert_eq!(wrong_method.status_code(), StatusCode::METHOD_NOT_ALLOWED);
    let body: Value = wrong_method.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "method_not_allowed");
    assert!(body["data"].is_null());

    let bad_path = server.get("/api/students/%FF").await;
    assert_eq!(bad_path.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = bad_path.json();
    assert_eq!(body["code"], "bad_params");

    let oversized = server
        .post("/api/classes")
        .bytes(vec![b' '; 3 * 1024 * 1024].into())
        .await;
    assert_eq!(oversized.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = oversized.json();
    assert_eq!(body["code"], "payload_too_large");
}

#[tokio::test]
async fn storage_failures_answer_500_with_the_envelope() {
    let state = app_state();
    state.db.execute_batch("DROP TABLE todos").expect("drop todos");
    let server = TestServer::new(router(AppHandle::new(state, 0), &[])).expect("test server");
    let token = admin_token(&server).await;

    let failed = server.get("/api/todos").authorization_bearer(&token).await;
    assert_eq!(failed.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = failed.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "db_query_failed");
}

#[tokio::test]
async fn path_and_query_become_parameters() {
    let server = server(0);
    let token = admin_token(&server).await;

    let created = server
        .post("/api/classes")
        .authorization_bearer(&token)
        .json(&json!({ "name": "Primary 5", "gradeLevel": 5 }))
        .await;
    assert_eq!(created.status_code(), StatusCode::CREATED);
    let class: Value = created.json();
    let class_id = class["data"]["id"].as_str().expect("id").to_string();

    let section = server
        .post(&format!("/api/classes/{}/sections", class_id))
        .authorization_bearer(&token)
        .json(&json!({ "name": "A" }))
        .await;
    assert_eq!(section.status_code(), StatusCode::CREATED);

    let duplicate = server
        .post(&format!("/api/classes/{}/sections", class_id))
        .authorization_bearer(&token)
        .json(&json!({ "name": "A" }))
        .await;
    assert_eq!(duplicate.status_code(), StatusCode::CONFLICT);

    for admission_no in ["S-1", "S-2", "S-3"] {
        let response = server
            .post("/api/students")
            .authorization_bearer(&token)
            .json(&json!({
                "admissionNo": admission_no,
                "firstName": "Ada",
                "lastName": "Okafor",
                "classId": class_id
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
    }

    let page = server
        .get("/api/students")
        .authorization_bearer(&token)
        .add_query_param("classId", &class_id)
        .add_query_param("limit", "2")
        .await;
    assert_eq!(page.status_code(), StatusCode::OK);
    let body: Value = page.json();
    assert_eq!(body["count"], 3);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(2));

    let updated = server
        .put(&format!("/api/classes/{}", class_id))
        .authorization_bearer(&token)
        .json(&json!({ "id": "ignored", "description": "Top floor" }))
        .await;
    assert_eq!(updated.status_code(), StatusCode::OK);
    let body: Value = updated.json();
    assert_eq!(body["data"]["id"], class_id.as_str());
    assert_eq!(body["data"]["description"], "Top floor");
}

#[tokio::test]
async fn non_office_writes_are_forbidden() {
    let server = server(0);
    let token = admin_token(&server).await;
    let created = server
        .post("/api/auth/register")
        .authorization_bearer(&token)
        .json(&json!({ "username": "grace", "password": PASSWORD, "role": "parent" }))
        .await;
    assert_eq!(created.status_code(), StatusCode::CREATED);

    let login = server
        .post("/api/auth/login")
        .json(&json!({ "username": "grace", "password": PASSWORD }))
        .await;
    let body: Value = login.json();
    let parent = body["data"]["token"].as_str().expect("token").to_string();

    let denied = server
        .post("/api/classes")
        .authorization_bearer(&parent)
        .json(&json!({ "name": "Primary 6" }))
        .await;
    assert_eq!(denied.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn requests_over_the_budget_are_limited() {
    let server = server(2);
    assert_eq!(server.get("/api/health").await.status_code(), StatusCode::OK);
    assert_eq!(server.get("/api/health").await.status_code(), StatusCode::OK);

    let limited = server.get("/api/health").await;
    assert_eq!(limited.status_code(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = limited.json();
    assert_eq!(body["code"], "rate_limited");
}
