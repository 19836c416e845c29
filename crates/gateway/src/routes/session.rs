//! Session and message endpoints (§6: `/session*`).

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sa_domain::error::Error;
use sa_engine::message::{AssistantMeta, FinishReason, Message, Part, Role};
use sa_engine::SessionInfo;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.store.list())
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<Json<SessionInfo>> {
    let info = state.engine.create_session(body.title).await?;
    if state.config.permissions.auto_approve {
        state.permission_gate.set_auto_approve(&info.id, true);
    }
    Ok(Json(info))
}

pub async fn remove_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<bool>> {
    let removed = state.engine.remove_session(&session_id).await?;
    Ok(Json(removed))
}

pub async fn abort_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<bool> {
    Json(state.engine.abort(&session_id))
}

pub async fn share_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    let info = state.store.share(&session_id).await?;
    Ok(Json(info))
}

pub async fn unshare_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionInfo>> {
    let info = state.store.unshare(&session_id).await?;
    Ok(Json(info))
}

#[derive(Debug, Serialize)]
pub struct MessageInfo {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finish_reason: Option<FinishReason>,
    pub assistant_meta: Option<AssistantMeta>,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

impl From<Message> for MessageView {
    fn from(message: Message) -> Self {
        MessageView {
            info: MessageInfo {
                id: message.id,
                session_id: message.session_id,
                role: message.role,
                created_at: message.created_at,
                completed_at: message.completed_at,
                finish_reason: message.finish_reason,
                assistant_meta: message.assistant_meta,
            },
            parts: message.parts,
        }
    }
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<MessageView>>> {
    let messages = state.store.get_messages(&session_id)?;
    Ok(Json(messages.into_iter().map(MessageView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    #[serde(rename = "providerID", default)]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default)]
    pub model_id: Option<String>,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub mode: Option<String>,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<impl IntoResponse> {
    if state.store.get(&session_id).is_none() {
        return Err(ApiError(Error::NotFound(format!("session {session_id}"))));
    }

    let provider_id = body
        .provider_id
        .unwrap_or_else(|| state.config.provider.default_provider.clone());
    let model_id = body
        .model_id
        .unwrap_or_else(|| state.config.provider.default_model.clone());
    let mode = body.mode.and_then(|name| state.config.mode(&name));

    state
        .engine
        .chat(&session_id, &provider_id, &model_id, body.parts, mode)
        .await?;

    let messages = state.store.get_messages(&session_id)?;
    let last = messages
        .into_iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .ok_or_else(|| Error::Other("no assistant message produced".into()))?;
    Ok(Json(MessageView::from(last)))
}

pub async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "default": {
            "providerID": state.config.provider.default_provider,
            "modelID": state.config.provider.default_model,
        },
    }))
}
