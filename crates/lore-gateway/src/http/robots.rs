use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::envelope::{ApiError, ApiResult};
use lore_retrieval::{RetrievedContext, RetrieverConfig};
use lore_store::robots::RobotSpec;
use lore_store::types::Robot;

#[derive(Deserialize)]
pub struct RobotRequest {
    pub name: String,
    pub description: Option<String>,
    pub chat_llm_id: i64,
    pub rerank_llm_id: Option<i64>,
    #[serde(default)]
    pub enable_rerank: bool,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub knowledge_ids: Vec<i64>,
}

fn default_top_k() -> i64 {
    5
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> i64 {
    2000
}

impl RobotRequest {
    fn into_spec(self) -> RobotSpec {
        RobotSpec {
            name: self.name,
            description: self.description,
            chat_llm_id: self.chat_llm_id,
            rerank_llm_id: self.rerank_llm_id,
            enable_rerank: self.enable_rerank,
            top_k: self.top_k,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt,
            knowledge_ids: self.knowledge_ids,
        }
    }
}

#[derive(Serialize)]
pub struct RobotDetail {
    #[serde(flatten)]
    pub robot: Robot,
    pub knowledge_ids: Vec<i64>,
}

pub async fn create_robot(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<RobotRequest>,
) -> ApiResult<Json<RobotDetail>> {
    let robot = state.robots.create(user.id, &req.into_spec())?;
    let knowledge_ids = state.robots.knowledge_ids(robot.id)?;
    Ok(Json(RobotDetail {
        robot,
        knowledge_ids,
    }))
}

pub async fn list_robots(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<RobotDetail>>> {
    let robots = state.robots.list_for_user(user.id)?;
    let mut out = Vec::with_capacity(robots.len());
    for robot in robots {
        let knowledge_ids = state.robots.knowledge_ids(robot.id)?;
        out.push(RobotDetail {
            robot,
            knowledge_ids,
        });
    }
    Ok(Json(out))
}

pub async fn get_robot(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<RobotDetail>> {
    let robot = state.robots.get_owned(id, user.id, user.is_admin())?;
    let knowledge_ids = state.robots.knowledge_ids(robot.id)?;
    Ok(Json(RobotDetail {
        robot,
        knowledge_ids,
    }))
}

pub async fn update_robot(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<RobotRequest>,
) -> ApiResult<Json<RobotDetail>> {
    state.robots.get_owned(id, user.id, user.is_admin())?;
    let robot = state.robots.update(id, &req.into_spec())?;
    let knowledge_ids = state.robots.knowledge_ids(robot.id)?;
    Ok(Json(RobotDetail {
        robot,
        knowledge_ids,
    }))
}

pub async fn delete_robot(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.robots.get_owned(id, user.id, user.is_admin())?;
    state.robots.delete(id)?;
    Ok(Json(serde_json::json!({ "message": "robot deleted" })))
}

#[derive(Deserialize)]
pub struct RetrievalTestRequest {
    pub query: String,
    #[serde(default = "default_test_top_k")]
    pub top_k: usize,
    #[serde(default = "default_mode")]
    pub retrieval_mode: String,
}

fn default_test_top_k() -> usize {
    5
}
fn default_mode() -> String {
    "hybrid".to_string()
}

#[derive(Serialize)]
pub struct RetrievalTestResponse {
    pub query: String,
    pub retrieval_mode: String,
    pub results: Vec<RetrievedContext>,
    pub retrieval_time: f64,
}

/// Ad-hoc retrieval against a robot's knowledge set. Rate limited per user.
pub async fn retrieval_test(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<RetrievalTestRequest>,
) -> ApiResult<Json<RetrievalTestResponse>> {
    if !state.retrieval_limiter.check(user.id) {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "retrieval test limit reached (30/min), slow down",
        ));
    }

    let robot = state.robots.get_owned(id, user.id, user.is_admin())?;
    let knowledge_ids = state.robots.knowledge_ids(id)?;
    let active = state.knowledge.active_ids(&knowledge_ids)?;

    run_retrieval_test(&state, &robot, &active, req).await
}

pub(crate) async fn run_retrieval_test(
    state: &AppState,
    robot: &Robot,
    knowledge_ids: &[i64],
    req: RetrievalTestRequest,
) -> ApiResult<Json<RetrievalTestResponse>> {
    let started = std::time::Instant::now();
    let mode = RetrieverConfig::parse(&req.retrieval_mode);

    let results = match mode {
        RetrieverConfig::Vector => {
            let hits = state
                .retriever
                .vector_retrieve(knowledge_ids, &req.query, req.top_k)
                .await;
            state.retriever.hydrate_leg(hits, "vector").await?
        }
        RetrieverConfig::Keyword => {
            let hits = state
                .retriever
                .keyword_retrieve(knowledge_ids, &req.query, req.top_k)
                .await;
            state.retriever.hydrate_leg(hits, "keyword").await?
        }
        RetrieverConfig::Hybrid => {
            state
                .retriever
                .hybrid_retrieve(robot, knowledge_ids, &req.query, req.top_k)
                .await?
        }
    };

    Ok(Json(RetrievalTestResponse {
        query: req.query,
        retrieval_mode: req.retrieval_mode,
        results,
        retrieval_time: started.elapsed().as_secs_f64(),
    }))
}
