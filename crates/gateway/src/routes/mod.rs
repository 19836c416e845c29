pub mod app;
pub mod event;
pub mod file;
pub mod session;

#[cfg(test)]
mod tests;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::app_state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/app", get(app::app_info))
        .route("/config", get(app::get_config))
        .route("/config/providers", get(session::list_providers))
        .route("/health", get(app::health))
        .route("/openapi.json", get(app::openapi))
        .route(
            "/session",
            get(session::list_sessions).post(session::create_session),
        )
        .route("/session/:id", delete(session::remove_session))
        .route("/session/:id/abort", post(session::abort_session))
        .route(
            "/session/:id/share",
            post(session::share_session).delete(session::unshare_session),
        )
        .route(
            "/session/:id/message",
            get(session::list_messages).post(session::send_message),
        )
        .route("/event", get(event::stream_events))
        .route("/file", get(file::read_file))
        .route("/file/status", get(file::file_status))
        .route("/find", get(file::find_grep))
        .route("/find/file", get(file::find_file))
        .route("/find/symbol", get(file::find_symbol))
        .with_state(state)
}
