//! The three HTTP surfaces spec.md names: create a message (which starts
//! an agent run), stream its events over SSE, and replay them as JSON.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ts_streaming::driver::drive;
use ts_streaming::message::Message;
use ts_streaming::persistence::DEFAULT_PAGE_LIMIT;
use ts_streaming::watcher::{watch, WatcherConfig};

use crate::api::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message_id: String,
    pub stream_url: String,
}

/// `POST /api/chats/{chat_id}/messages` — create a message and kick off
/// its agent run. The run happens entirely off the request's lifetime:
/// this handler returns as soon as the run is registered, not when it
/// finishes.
pub async fn create_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    let message_id = Uuid::new_v4().to_string();
    let message = Message::new_user_turn(message_id.clone(), chat_id.clone(), req.content.clone());
    state.messages.create(message).await?;

    let started = state.registry.start_agent(
        message_id.clone(),
        chat_id.clone(),
        drive(
            state.events.clone(),
            state.messages.clone(),
            state.graph.clone(),
            state.config.driver.clone(),
            state.config.emitter.queue_capacity,
            chat_id.clone(),
            message_id.clone(),
            req.content,
            req.metadata,
        ),
    );
    if !started {
        return Err(ApiError::AlreadyRunning(message_id));
    }

    let stream_url = format!("/api/chats/{chat_id}/messages/{message_id}/stream");
    Ok((StatusCode::CREATED, Json(MessageResponse { message_id, stream_url })))
}

#[derive(Deserialize)]
pub struct ReplayParams {
    pub since: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct ReplayResponse {
    pub message_id: String,
    pub events: Vec<ts_streaming::PersistedEvent>,
    pub count: usize,
}

/// `GET /api/messages/{message_id}/events?since=` — a one-shot JSON page
/// of persisted events, for clients that don't want SSE (or are catching
/// up after a long disconnect rather than tailing live).
pub async fn list_message_events(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Query(params): Query<ReplayParams>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let events = state
        .events
        .get_events(&message_id, params.since.as_deref(), params.limit.unwrap_or(DEFAULT_PAGE_LIMIT))
        .await?;
    Ok(Json(ReplayResponse { message_id, count: events.len(), events }))
}

/// `GET /api/chats/{chat_id}/messages/{message_id}/stream` — SSE tail of
/// a message's event log. Resumable via the standard `Last-Event-ID`
/// header; the watcher itself (see `ts_streaming::watcher`) never reads
/// from the emitter, only from persistence, so a reconnect here and a
/// fresh first connection are the same code path.
pub async fn stream_message_events(
    State(state): State<AppState>,
    Path((_chat_id, message_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let since_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ts_streaming::PersistedEvent>();

    let store = state.events.clone();
    let registry = state.registry.clone();
    let watcher_config = WatcherConfig {
        message_id,
        since_id,
        poll_interval: Duration::from_millis(state.config.watcher.poll_interval_ms),
        max_wait: Duration::from_secs(state.config.watcher.max_wait_secs),
        dedup_capacity: state.config.watcher.dedup_capacity,
    };

    tokio::spawn(async move {
        watch(&*store, &registry, watcher_config, |event| tx.send(event.clone()).is_ok()).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            // Serialize the full envelope, not just the inner event, so the
            // `data:` payload carries `v` and `ts` per the event schema —
            // the same shape the replay endpoint returns.
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default()
                .event(event.event.type_name())
                .id(event.id.clone())
                .data(data));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /api/messages/{message_id}` — the message record itself (role,
/// status, final text/error/interrupt payload once terminal).
pub async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<Message>, ApiError> {
    let message = state
        .messages
        .get(&message_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no message {message_id}")))?;
    Ok(Json(message))
}
