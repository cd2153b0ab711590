use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use appforge_contract::{Framework, Session};

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub framework: Framework,
}

pub async fn create_session(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name cannot be empty".to_string()));
    }
    let session = Session::new(body.name.trim(), body.framework, &user.user_id);
    state.sessions.create_session(&session).await?;
    Ok(Json(session))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.sessions.list_sessions(&user.user_id).await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session = load_owned(&state, &id, &user.user_id).await?;
    Ok(Json(session))
}

/// Load a session and enforce ownership; cross-user access is 403.
pub async fn load_owned(
    state: &AppState,
    session_id: &str,
    user_id: &str,
) -> Result<Session, ApiError> {
    let session = state
        .sessions
        .get_session(session_id)
        .await?
        .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))?;
    if session.created_by != user_id {
        return Err(ApiError::Forbidden);
    }
    Ok(session)
}
