use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::app::AppState;
use crate::auth::AdminUser;
use crate::envelope::ApiResult;
use lore_store::types::{ApiKey, Llm};

#[derive(Deserialize)]
pub struct ListQuery {
    pub model_type: Option<String>,
}

pub async fn list_llms(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Llm>>> {
    Ok(Json(state.llms.list(query.model_type.as_deref())?))
}

#[derive(Deserialize)]
pub struct CreateLlmRequest {
    pub name: String,
    pub model_type: String,
    pub provider: String,
    pub model_name: String,
    pub base_url: Option<String>,
    pub api_version: Option<String>,
}

pub async fn create_llm(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Json(req): Json<CreateLlmRequest>,
) -> ApiResult<Json<Llm>> {
    let llm = state.llms.create(
        &req.name,
        &req.model_type,
        &req.provider,
        &req.model_name,
        req.base_url.as_deref(),
        req.api_version.as_deref(),
    )?;
    Ok(Json(llm))
}

#[derive(Deserialize)]
pub struct UpdateLlmRequest {
    pub status: i64,
}

pub async fn update_llm(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateLlmRequest>,
) -> ApiResult<Json<Llm>> {
    state.llms.update_status(id, req.status)?;
    Ok(Json(state.llms.get(id)?))
}

pub async fn delete_llm(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.llms.delete(id)?;
    Ok(Json(serde_json::json!({ "message": "LLM deleted" })))
}

pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<ApiKey>>> {
    Ok(Json(state.llms.list_api_keys(id)?))
}

#[derive(Deserialize)]
pub struct CreateApiKeyRequest {
    pub alias: String,
    pub api_key: String,
}

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateApiKeyRequest>,
) -> ApiResult<Json<ApiKey>> {
    Ok(Json(state.llms.add_api_key(id, &req.alias, &req.api_key)?))
}

pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path((_id, key_id)): Path<(i64, i64)>,
) -> ApiResult<Json<serde_json::Value>> {
    state.llms.delete_api_key(key_id)?;
    Ok(Json(serde_json::json!({ "message": "API key deleted" })))
}
