//! Ambient operability + app-info endpoints (§6: `/app`, `/config`,
//! `/health`, `/openapi.json`).

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use crate::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct AppInfo {
    pub cwd: String,
    pub root: String,
    pub version: &'static str,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub async fn app_info(State(state): State<AppState>) -> Json<AppInfo> {
    Json(AppInfo {
        cwd: std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        root: state.workspace_root.display().to_string(),
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
    })
}

pub async fn get_config(State(state): State<AppState>) -> Json<sa_engine::Config> {
    Json((*state.config).clone())
}

pub async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn openapi() -> Json<Value> {
    Json(serde_json::json!({
        "openapi": "3.0.3",
        "info": { "title": "session-engine gateway", "version": env!("CARGO_PKG_VERSION") },
        "paths": {
            "/app": { "get": { "summary": "App info" } },
            "/config": { "get": { "summary": "Resolved configuration" } },
            "/config/providers": { "get": { "summary": "Providers and defaults" } },
            "/session": {
                "get": { "summary": "List sessions" },
                "post": { "summary": "Create session" }
            },
            "/session/{id}": { "delete": { "summary": "Remove session" } },
            "/session/{id}/abort": { "post": { "summary": "Cancel in-flight turn" } },
            "/session/{id}/share": {
                "post": { "summary": "Allocate share token" },
                "delete": { "summary": "Revoke share token" }
            },
            "/session/{id}/message": {
                "get": { "summary": "List messages" },
                "post": { "summary": "Start a chat turn" }
            },
            "/event": { "get": { "summary": "SSE stream of bus events" } },
            "/file": { "get": { "summary": "Read a workspace file" } },
            "/file/status": { "get": { "summary": "Changed files" } },
            "/find": { "get": { "summary": "Grep workspace files" } },
            "/find/file": { "get": { "summary": "Glob workspace files" } },
            "/health": { "get": { "summary": "Liveness probe" } }
        }
    }))
}
