//! HTTP-surface smoke tests, exercised directly against the `Router` via
//! `tower::ServiceExt::oneshot` rather than a bound socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use tower::ServiceExt;

use sa_engine::provider::{MockAdapter, MockBehavior};
use sa_engine::{
    Config, EventBus, FileTimeGuard, FsStorage, Identifier, PendingTurnTable, PermissionGate,
    SessionEngine, SessionStore, ToolRegistry,
};

use crate::app_state::AppState;
use crate::routes::build_router;

async fn test_state(dir: &std::path::Path) -> AppState {
    let events = Arc::new(EventBus::default());
    let ids = Arc::new(Identifier::new());
    let storage = Arc::new(FsStorage::new(dir.join("state"), events.clone()));
    let store = Arc::new(SessionStore::new(storage, events.clone(), ids.clone()));
    let permission_gate = Arc::new(PermissionGate::new(events.clone()));
    let file_guard = Arc::new(FileTimeGuard::new());
    let tools = Arc::new(ToolRegistry::new(
        dir.to_path_buf(),
        file_guard,
        permission_gate.clone(),
        ids.clone(),
    ));
    let mut providers: std::collections::HashMap<String, Arc<dyn sa_engine::ProviderAdapter>> =
        std::collections::HashMap::new();
    providers.insert(
        "mock".to_string(),
        Arc::new(MockAdapter::new("mock", MockBehavior::UppercaseEcho)),
    );
    let pending = Arc::new(PendingTurnTable::new());
    let engine = Arc::new(SessionEngine::new(
        store.clone(),
        tools,
        providers,
        events.clone(),
        ids,
        pending,
        false,
    ));
    AppState::new(
        Arc::new(Config::default()),
        engine,
        store,
        events,
        permission_gate,
        dir.to_path_buf(),
    )
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(dir.path()).await);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_session_then_chat_returns_final_assistant_message() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(dir.path()).await);

    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/session")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::OK);
    let body = axum::body::to_bytes(create.into_body(), usize::MAX).await.unwrap();
    let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let session_id = info["id"].as_str().unwrap().to_string();

    let chat_body = serde_json::json!({
        "providerID": "mock",
        "modelID": "echo",
        "parts": [{"type": "text", "data": {"text": "hi"}}],
    });
    let chat = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/session/{session_id}/message"))
                .header("content-type", "application/json")
                .body(Body::from(chat_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(chat.status(), StatusCode::OK);
    let body = axum::body::to_bytes(chat.into_body(), usize::MAX).await.unwrap();
    let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(view["info"]["finish_reason"], "endTurn");
}

#[tokio::test]
async fn abort_on_idle_session_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(test_state(dir.path()).await);

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/session/nonexistent/abort")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"false");
}
