use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::{error, info};

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::envelope::{ApiError, ApiResult};
use lore_store::types::Knowledge;
use lore_store::KnowledgeStore;

#[derive(Deserialize)]
pub struct CreateKnowledgeRequest {
    pub name: String,
    pub description: Option<String>,
    pub embed_llm_id: i64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: i64,
}

fn default_chunk_size() -> i64 {
    500
}
fn default_chunk_overlap() -> i64 {
    50
}

pub async fn create_knowledge(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateKnowledgeRequest>,
) -> ApiResult<Json<Knowledge>> {
    // The embedding model binding is permanent; verify it up front.
    let embed_llm = state
        .llms
        .get(req.embed_llm_id)
        .map_err(|_| ApiError::not_found("embedding model does not exist"))?;
    if embed_llm.model_type != "embedding" {
        return Err(ApiError::not_found(
            "embedding model does not exist or has the wrong type",
        ));
    }

    let collection = KnowledgeStore::new_collection_name(user.id);
    let kb = state.knowledge.create(
        user.id,
        &req.name,
        req.description.as_deref(),
        req.embed_llm_id,
        &collection,
        req.chunk_size,
        req.chunk_overlap,
    )?;

    // Collection creation failure rolls the row back; a KB without its
    // collection would poison every later upload.
    let dim = state.embedder.dim() as u64;
    if let Err(e) = state
        .vectors
        .create_collection(&collection, dim, &format!("Knowledge {} vectors", kb.name))
        .await
    {
        error!(error = %e, collection, "vector collection creation failed, rolling back");
        let _ = state.knowledge.delete(kb.id);
        return Err(ApiError::internal(format!(
            "vector collection creation failed: {}",
            e
        )));
    }

    info!(knowledge_id = kb.id, name = %kb.name, "knowledge base created");
    Ok(Json(kb))
}

pub async fn list_knowledge(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<Knowledge>>> {
    Ok(Json(state.knowledge.list_for_user(user.id, user.is_admin())?))
}

pub async fn get_knowledge(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Knowledge>> {
    Ok(Json(state.knowledge.get_owned(id, user.id, user.is_admin())?))
}

#[derive(Deserialize)]
pub struct UpdateKnowledgeRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<i64>,
}

pub async fn update_knowledge(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateKnowledgeRequest>,
) -> ApiResult<Json<Knowledge>> {
    state.knowledge.get_owned(id, user.id, user.is_admin())?;
    Ok(Json(state.knowledge.update(
        id,
        req.name.as_deref(),
        req.description.as_deref(),
        req.status,
    )?))
}

/// Delete a KB and everything hanging off it: stored files, document rows,
/// both external stores, then the row itself.
pub async fn delete_knowledge(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let kb = state.knowledge.get_owned(id, user.id, user.is_admin())?;

    for doc_id in state.documents.list_ids_for_knowledge(id)? {
        if let Ok(doc) = state.documents.get(doc_id) {
            state.storage.delete(&doc.file_path);
        }
        let _ = state.documents.delete(doc_id);
    }

    if let Err(e) = state.vectors.drop_collection(&kb.vector_collection_name).await {
        error!(error = %e, "dropping vector collection failed");
    }
    if let Err(e) = state.index.delete_by_knowledge(id).await {
        error!(error = %e, "clearing inverted index failed");
    }

    state.knowledge.delete(id)?;
    info!(knowledge_id = id, "knowledge base deleted");
    Ok(Json(serde_json::json!({ "message": "knowledge base deleted" })))
}
