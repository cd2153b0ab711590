//! HTTP/SSE gateway.
//!
//! Exposes the sessions API and the agent streaming endpoints, translating
//! stored events into the SSE wire format with resumable watermark
//! semantics. Also hosts the protocol-peer endpoints the agent container
//! calls back into for dev-container exec and dev-server control.

pub mod agent;
pub mod auth;
pub mod dev_containers;
pub mod error;
pub mod sessions;
pub mod sse;
pub mod state;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/sessions", post(sessions::create_session).get(sessions::list_sessions))
        .route("/sessions/:id", get(sessions::get_session))
        .route("/apps/:sid/agent/generate", post(agent::generate))
        .route("/apps/:sid/agent/stream-continue", get(agent::stream_continue))
        .route("/apps/:sid/agent/stop", post(agent::stop))
        .route("/apps/:sid/agent/history", get(agent::history))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    let internal = Router::new()
        .route("/apps/:sid/exec", post(dev_containers::exec))
        .route("/apps/:sid/dev-server/start", post(dev_containers::dev_server_start))
        .route("/apps/:sid/dev-server/status", post(dev_containers::dev_server_status))
        .route("/apps/:sid/dev-server/stop", post(dev_containers::dev_server_stop));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/api", api)
        .nest("/internal", internal)
        .with_state(state)
}
