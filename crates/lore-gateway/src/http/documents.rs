use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::envelope::{ApiError, ApiResult, Envelope};
use lore_bus::{DocUpload, TOPIC_DOC_UPLOAD};
use lore_ingest::ALLOWED_TEXT_EXTENSIONS;
use lore_store::types::{Document, DocumentStatus, User};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

#[derive(Deserialize)]
pub struct KnowledgeQuery {
    pub knowledge_id: i64,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub document_id: i64,
    pub filename: String,
    pub file_size: usize,
    pub preview_url: String,
    pub mime_type: String,
    pub message: &'static str,
}

fn extension_of(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

fn mime_of(extension: &str) -> &'static str {
    match extension {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" => "text/html",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

fn check_owned_knowledge(
    state: &AppState,
    knowledge_id: i64,
    user: &User,
) -> ApiResult<lore_store::types::Knowledge> {
    let kb = state
        .knowledge
        .get_owned(knowledge_id, user.id, user.is_admin())?;
    if kb.status != 1 {
        return Err(ApiError::bad_request("knowledge base is disabled"));
    }
    Ok(kb)
}

/// POST /documents/upload?knowledge_id= — multipart upload. Text formats
/// are queued for ingestion; images and videos are stored as-is and never
/// parsed.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<KnowledgeQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    check_owned_knowledge(&state, query.knowledge_id, &user)?;

    let mut filename = String::new();
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("bad multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("upload.bin").to_string();
            bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("upload read failed: {}", e)))?
                .to_vec();
        }
    }
    if filename.is_empty() || bytes.is_empty() {
        return Err(ApiError::bad_request("missing file field"));
    }

    let ext = extension_of(&filename);
    let is_text = ALLOWED_TEXT_EXTENSIONS.contains(&ext.as_str());
    let is_media =
        IMAGE_EXTENSIONS.contains(&ext.as_str()) || VIDEO_EXTENSIONS.contains(&ext.as_str());
    if !is_text && !is_media {
        return Err(ApiError::bad_request(format!(
            "unsupported file type: .{}. supported: {}",
            ext,
            ALLOWED_TEXT_EXTENSIONS
                .iter()
                .map(|e| format!(".{}", e))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let max = state.config.storage.max_file_size;
    if bytes.len() as u64 > max {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("file too large (max {} MiB)", max / 1024 / 1024),
        ));
    }

    let relative = state
        .storage
        .save(query.knowledge_id, &filename, &bytes)
        .map_err(|e| ApiError::internal(format!("file save failed: {}", e)))?;

    let mime = mime_of(&ext);
    let document = state.documents.insert(
        query.knowledge_id,
        &filename,
        &ext,
        &relative,
        bytes.len() as i64,
        mime,
    )?;

    if is_text {
        state.bus.publish(
            TOPIC_DOC_UPLOAD,
            &DocUpload {
                document_id: document.id,
                file_path: relative,
                file_name: filename.clone(),
                knowledge_id: query.knowledge_id,
            },
        )?;
        info!(document_id = document.id, file = %filename, "document queued for ingestion");
    } else {
        // Media uploads skip the pipeline entirely.
        state
            .documents
            .set_status(document.id, DocumentStatus::Completed, None)?;
        info!(document_id = document.id, file = %filename, "media file stored without ingestion");
    }

    Ok(Json(UploadResponse {
        document_id: document.id,
        filename,
        file_size: bytes.len(),
        preview_url: format!("/api/v1/documents/{}/preview", document.id),
        mime_type: mime.to_string(),
        message: "upload accepted, processing in background",
    }))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub knowledge_id: i64,
    pub keyword: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Serialize)]
pub struct DocumentListResponse {
    pub total: i64,
    pub items: Vec<Document>,
}

pub async fn list_documents(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<DocumentListResponse>> {
    state
        .knowledge
        .get_owned(query.knowledge_id, user.id, user.is_admin())?;
    let (total, items) = state.documents.list(
        query.knowledge_id,
        query.keyword.as_deref(),
        query.status.as_deref(),
        query.skip,
        query.limit.min(100),
    )?;
    Ok(Json(DocumentListResponse { total, items }))
}

fn get_owned_document(state: &AppState, id: i64, user: &User) -> ApiResult<Document> {
    let document = state.documents.get(id)?;
    state
        .knowledge
        .get_owned(document.knowledge_id, user.id, user.is_admin())?;
    Ok(document)
}

pub async fn get_document(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Document>> {
    Ok(Json(get_owned_document(&state, id, &user)?))
}

/// Delete: file, both stores, row, then recompute KB counters.
pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let document = get_owned_document(&state, id, &user)?;
    let kb = state.knowledge.get(document.knowledge_id)?;

    state.storage.delete(&document.file_path);
    if let Err(e) = state
        .vectors
        .delete_by_document(&kb.vector_collection_name, id)
        .await
    {
        error!(document_id = id, error = %e, "vector cleanup failed");
    }
    if let Err(e) = state.index.delete_by_document(id).await {
        error!(document_id = id, error = %e, "index cleanup failed");
    }

    state.documents.delete(id)?;
    state
        .documents
        .recompute_knowledge_counters(document.knowledge_id)?;
    info!(document_id = id, "document deleted");
    Ok(Json(serde_json::json!({ "message": "document deleted" })))
}

/// Requeue a failed ingestion from the top of the pipeline. Always HTTP
/// 200; the envelope's `code` carries the business result.
pub async fn retry_document(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Envelope>> {
    let document = get_owned_document(&state, id, &user)?;

    if document.status != DocumentStatus::Failed {
        return Ok(Json(Envelope {
            code: 400,
            msg: format!(
                "document is {}, only failed documents can be retried",
                document.status.as_str()
            ),
            detail: None,
        }));
    }

    state
        .documents
        .set_status(id, DocumentStatus::Uploading, None)?;
    match state.bus.publish(
        TOPIC_DOC_UPLOAD,
        &DocUpload {
            document_id: document.id,
            file_path: document.file_path.clone(),
            file_name: document.file_name.clone(),
            knowledge_id: document.knowledge_id,
        },
    ) {
        Ok(()) => {
            info!(document_id = id, "document requeued for ingestion");
            Ok(Json(Envelope {
                code: 200,
                msg: "retry started".to_string(),
                detail: None,
            }))
        }
        Err(e) => {
            warn!(document_id = id, error = %e, "retry enqueue failed");
            Ok(Json(Envelope {
                code: 500,
                msg: "retry could not be started".to_string(),
                detail: Some(e.to_string()),
            }))
        }
    }
}

/// Stream the original file back.
pub async fn preview(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let document = get_owned_document(&state, id, &user)?;
    let bytes = state
        .storage
        .read(&document.file_path)
        .map_err(|_| ApiError::not_found("stored file is missing"))?;

    Ok((
        [
            (header::CONTENT_TYPE, document.mime_type.clone()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", document.file_name),
            ),
        ],
        bytes,
    ))
}

/// Image thumbnail endpoint: serves stored images directly, 415 otherwise.
pub async fn thumbnail(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let document = get_owned_document(&state, id, &user)?;
    if !document.mime_type.starts_with("image/") {
        return Err(ApiError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "document is not an image",
        ));
    }
    let bytes = state
        .storage
        .read(&document.file_path)
        .map_err(|_| ApiError::not_found("stored file is missing"))?;
    Ok(([(header::CONTENT_TYPE, document.mime_type.clone())], bytes))
}
