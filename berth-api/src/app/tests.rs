use super::{app_router, AppState};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use berth_core::{ContainerManager, ManagerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app() -> Router {
    let state = AppState {
        manager: Arc::new(ContainerManager::new(ManagerConfig::default())),
    };
    app_router(state, Vec::new())
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_ok() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_then_prepare_attach_returns_stream_url() {
    let app = app();
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/containers",
            json!({ "name": "web", "command": "sh", "tty": true, "stdin": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"]["state"], "created");

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/containers/{id}/attach"),
            json!({ "stdin": true, "stdout": true, "tty": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["url"]
        .as_str()
        .unwrap()
        .contains("/stream/attach/"));
}

#[tokio::test]
async fn prepare_attach_unknown_container_is_404() {
    let response = app()
        .oneshot(json_request(
            "POST",
            "/containers/missing/attach",
            json!({ "stdout": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NotFound");
}

#[tokio::test]
async fn prepare_attach_rejects_tty_with_stderr() {
    let app = app();
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/containers",
            json!({ "name": "web", "command": "sh", "tty": true }),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/containers/{id}/attach"),
            json!({ "stdout": true, "stderr": true, "tty": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "InvalidRequest");
}

#[tokio::test]
async fn invalid_container_name_is_rejected() {
    let response = app()
        .oneshot(json_request(
            "POST",
            "/containers",
            json!({ "name": "bad name", "command": "sh" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_route_is_404() {
    let response = app()
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
