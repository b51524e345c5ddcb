use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::envelope::ApiResult;
use lore_store::types::{ChatMessageRow, Session};

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub robot_id: i64,
    pub title: Option<String>,
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<Session>> {
    // Robot must exist and belong to the caller.
    let robot = state
        .robots
        .get_owned(req.robot_id, user.id, user.is_admin())?;
    let session = state
        .sessions
        .create(user.id, req.robot_id, req.title.as_deref())?;
    state.context.init_context(
        &session.session_id,
        user.id,
        req.robot_id,
        &robot.system_prompt,
    );
    Ok(Json(session))
}

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    pub robot_id: Option<i64>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_status() -> String {
    "active".to_string()
}
fn default_limit() -> usize {
    20
}

#[derive(Serialize)]
pub struct SessionListResponse {
    pub total: i64,
    pub sessions: Vec<Session>,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<SessionListResponse>> {
    let (total, sessions) = state.sessions.list(
        user.id,
        query.robot_id,
        &query.status,
        query.skip,
        query.limit.min(100),
    )?;
    Ok(Json(SessionListResponse { total, sessions }))
}

#[derive(Deserialize)]
pub struct DetailQuery {
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
}

fn default_message_limit() -> usize {
    50
}

#[derive(Serialize)]
pub struct SessionDetailResponse {
    pub session: Session,
    pub messages: Vec<ChatMessageRow>,
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<DetailQuery>,
) -> ApiResult<Json<SessionDetailResponse>> {
    let session = state.sessions.get_owned(&session_id, user.id)?;
    let messages = state
        .sessions
        .messages(&session_id, query.message_limit.clamp(1, 200))?;
    Ok(Json(SessionDetailResponse { session, messages }))
}

/// GET /chat/history/{session_id} — alias for session detail.
pub async fn history(
    state: State<Arc<AppState>>,
    user: CurrentUser,
    session_id: Path<String>,
    query: Query<DetailQuery>,
) -> ApiResult<Json<SessionDetailResponse>> {
    get_session(state, user, session_id, query).await
}

#[derive(Deserialize)]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub is_pinned: Option<bool>,
    pub status: Option<String>,
}

pub async fn update_session(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(session_id): Path<String>,
    Json(req): Json<UpdateSessionRequest>,
) -> ApiResult<Json<Session>> {
    let session = state.sessions.update(
        &session_id,
        user.id,
        req.title.as_deref(),
        req.is_pinned,
        req.status.as_deref(),
    )?;

    // Archiving drops the hot-path state for the session.
    if session.status == "archived" {
        state.context.clear_context(&session_id);
        state.context.remove_active_session(user.id, &session_id);
        info!(%session_id, "session archived");
    }
    Ok(Json(session))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.sessions.soft_delete(&session_id, user.id)?;
    state.context.clear_context(&session_id);
    state.context.remove_active_session(user.id, &session_id);
    Ok(Json(serde_json::json!({ "message": "session deleted" })))
}

#[derive(Deserialize)]
pub struct FeedbackRequest {
    pub message_id: String,
    pub feedback: i64,
    pub comment: Option<String>,
}

pub async fn feedback(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<FeedbackRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .sessions
        .update_feedback(user.id, &req.message_id, req.feedback, req.comment.as_deref())?;
    Ok(Json(serde_json::json!({ "message": "feedback recorded" })))
}
