use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::envelope::{ApiError, ApiResult};
use lore_retrieval::RecallRequest;

#[derive(Serialize)]
pub struct StartResponse {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub status: &'static str,
}

/// POST /recall/test — enqueue a batch retrieval-quality job.
pub async fn start_test(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<RecallRequest>,
) -> ApiResult<Json<StartResponse>> {
    // Callers may only evaluate knowledge bases they own.
    for knowledge_id in &req.knowledge_ids {
        state
            .knowledge
            .get_owned(*knowledge_id, user.id, user.is_admin())?;
    }

    let task_id = state.recall.start(req, user.id).map_err(|e| match e {
        lore_retrieval::RetrievalError::Validation(m) => ApiError::bad_request(m),
        other => other.into(),
    })?;
    Ok(Json(StartResponse {
        task_id,
        status: "pending",
    }))
}

/// GET /recall/status/{task_id} — poll job progress and results.
pub async fn status(
    State(state): State<Arc<AppState>>,
    CurrentUser(_user): CurrentUser,
    Path(task_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .recall
        .status(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("recall task not found or expired"))
}
