pub mod messages;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

/// Wire the three HTTP surfaces spec.md §6 names onto their routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chats/:chat_id/messages", post(messages::create_message))
        .route(
            "/api/chats/:chat_id/messages/:message_id/stream",
            get(messages::stream_message_events),
        )
        .route("/api/messages/:message_id/events", get(messages::list_message_events))
        .route("/api/messages/:message_id", get(messages::get_message))
        .with_state(state)
}

/// Maps domain/store errors onto JSON error responses, following the
/// teacher's `(StatusCode, Json(json!({"error": ...})))` handler idiom.
pub enum ApiError {
    NotFound(String),
    AlreadyRunning(String),
    BadRequest(String),
    Store(ts_domain::Error),
}

impl From<ts_domain::Error> for ApiError {
    fn from(err: ts_domain::Error) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what),
            ApiError::AlreadyRunning(id) => {
                (StatusCode::CONFLICT, format!("message {id} is already running"))
            }
            ApiError::BadRequest(what) => (StatusCode::BAD_REQUEST, what),
            ApiError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
