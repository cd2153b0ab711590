//! Agent streaming endpoints.
//!
//! `generate` persists the user turn synchronously, enqueues the task (no
//! prompt in the payload; the container rediscovers it from the store), and
//! streams events from a watermark taken at enqueue time. `stream-continue`
//! replays from a client-supplied watermark, or the full history when none
//! is given, then goes live. The client disconnecting never cancels the
//! task; `stop` does.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use tracing::{info, warn};

use appforge_contract::clock::monotonic_now;
use appforge_contract::storage::SortOrder;
use appforge_contract::{Event, EventType, Message};
use appforge_taskd::GenerateTask;

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::sessions::load_owned;
use crate::sse::event_frame;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamContinueParams {
    #[serde(default)]
    pub since_timestamp: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    100
}

pub async fn generate(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<String>,
    Json(body): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt cannot be empty".to_string()));
    }
    let session = load_owned(&state, &sid, &user.user_id).await?;

    // The user turn must be durable before the task exists; the container
    // reads the prompt back from the store.
    let user_msg = Message::user(&sid, body.prompt.trim());
    state.messages.append_message(&user_msg).await?;

    // Watermark before enqueue so only this run's events stream back.
    let watermark = monotonic_now();

    let task = GenerateTask {
        session_id: session.id.clone(),
        workspace_id: session.workspace_id.clone(),
        framework: session.framework,
    };
    state
        .tasks
        .enqueue(task)
        .await
        .map_err(ApiError::Internal)?;
    info!(session_id = %sid, message_id = %user_msg.id, "generation task enqueued");

    Ok(sse_response(stream_events(state, sid, Some(watermark))))
}

pub async fn stream_continue(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<String>,
    Query(params): Query<StreamContinueParams>,
) -> Result<Response, ApiError> {
    load_owned(&state, &sid, &user.user_id).await?;
    Ok(sse_response(stream_events(
        state,
        sid,
        params.since_timestamp,
    )))
}

pub async fn stop(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    load_owned(&state, &sid, &user.user_id).await?;
    state.stop.request_stop(&sid).await?;
    info!(session_id = %sid, "stop requested");
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn history(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(sid): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    load_owned(&state, &sid, &user.user_id).await?;
    let limit = params.limit.clamp(1, 1000);
    let messages = state
        .messages
        .list_messages(&sid, limit, SortOrder::Asc)
        .await?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

fn is_terminal(event: &Event) -> bool {
    event.event_type == EventType::Finish
}

/// The shared polling generator behind both streaming endpoints.
///
/// `since` of `None` means full history then live. After each batch the
/// watermark advances to the last-seen event timestamp, so reconnects never
/// duplicate and never miss.
pub fn stream_events(
    state: AppState,
    session_id: String,
    since: Option<f64>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let settings = state.stream.clone();
        let started = tokio::time::Instant::now();
        let mut watermark = since;
        let mut quiet_polls: u32 = 0;

        loop {
            if started.elapsed() > settings.idle_timeout {
                // Close without a finish; the client may resume.
                warn!(session_id = %session_id, "stream idle timeout");
                break;
            }

            let batch = match state
                .events
                .events_since(&session_id, watermark, settings.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "event poll failed");
                    tokio::time::sleep(settings.poll_interval).await;
                    continue;
                }
            };

            if batch.is_empty() {
                quiet_polls += 1;
                // The agent may have died between finish and our poll;
                // after a quiet stretch, check for a late finish or a
                // vanished run.
                if quiet_polls >= settings.quiet_polls_before_liveness_check {
                    quiet_polls = 0;
                    let running = state
                        .sessions
                        .get_session(&session_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|s| s.is_running)
                        .unwrap_or(false);
                    if !running {
                        match state.events.finish_event(&session_id).await {
                            Ok(Some(finish)) => {
                                yield Ok(Bytes::from(event_frame(&finish)));
                                yield Ok(Bytes::new());
                                return;
                            }
                            Ok(None) => {
                                let error_event = Event::agent_error(
                                    &session_id,
                                    appforge_contract::event::AgentErrorData {
                                        error: "agent stopped without finish event".to_string(),
                                        error_type: "agent_stopped".to_string(),
                                        namespace: Vec::new(),
                                    },
                                );
                                yield Ok(Bytes::from(event_frame(&error_event)));
                                return;
                            }
                            Err(e) => {
                                warn!(session_id = %session_id, error = %e, "finish lookup failed");
                            }
                        }
                    }
                }
            } else {
                quiet_polls = 0;
            }

            for event in batch {
                watermark = Some(event.timestamp);
                let terminal = is_terminal(&event);
                yield Ok(Bytes::from(event_frame(&event)));
                if terminal {
                    // One additional zero-byte flush, then close.
                    yield Ok(Bytes::new());
                    return;
                }
            }

            tokio::time::sleep(settings.poll_interval).await;
        }
    }
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    // Disable proxy buffering so frames flush immediately.
    headers.insert(
        header::HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    (headers, Body::from_stream(stream)).into_response()
}
