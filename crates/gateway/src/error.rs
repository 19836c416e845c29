//! Maps the engine's domain `Error` onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use sa_domain::error::Error;

/// Newtype around the shared domain error so we can implement the foreign
/// `IntoResponse` trait on it (orphan rule forbids doing so directly on
/// `sa_domain::error::Error` from this crate).
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "data": { "message": self.0.to_string() } }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
