use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub status: i64,
    /// RFC 3339; tokens issued before this instant are rejected.
    pub password_changed_at: Option<String>,
    pub created_at: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Llm {
    pub id: i64,
    pub name: String,
    /// chat | embedding | rerank
    pub model_type: String,
    pub provider: String,
    pub model_name: String,
    /// Full endpoint URL for the capability; empty means "local model".
    pub base_url: Option<String>,
    pub api_version: Option<String>,
    pub status: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub llm_id: i64,
    pub alias: String,
    #[serde(skip_serializing)]
    pub api_key_encrypted: String,
    /// Middle-masked form, safe to display.
    pub masked_key: String,
    pub status: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Knowledge {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Embedding model bound at creation; immutable afterwards.
    pub embed_llm_id: i64,
    /// Opaque handle into the vector store; immutable for the KB lifetime.
    pub vector_collection_name: String,
    pub chunk_size: i64,
    pub chunk_overlap: i64,
    pub document_count: i64,
    pub total_chunks: i64,
    pub status: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploading,
    Parsing,
    Splitting,
    Embedding,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "uploading",
            DocumentStatus::Parsing => "parsing",
            DocumentStatus::Splitting => "splitting",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(DocumentStatus::Uploading),
            "parsing" => Some(DocumentStatus::Parsing),
            "splitting" => Some(DocumentStatus::Splitting),
            "embedding" => Some(DocumentStatus::Embedding),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub knowledge_id: i64,
    pub file_name: String,
    pub file_extension: String,
    pub file_path: String,
    pub file_size: i64,
    pub mime_type: String,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    pub error_msg: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Robot {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub chat_llm_id: i64,
    pub rerank_llm_id: Option<i64>,
    pub enable_rerank: bool,
    pub top_k: i64,
    pub temperature: f64,
    pub max_tokens: i64,
    pub system_prompt: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: i64,
    pub robot_id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub message_count: i64,
    /// active | archived | deleted
    pub status: String,
    pub is_pinned: bool,
    pub last_message_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageRow {
    pub message_id: String,
    pub session_id: String,
    /// Dense, ascending, starts at 1 within a session.
    pub sequence: i64,
    pub role: String,
    pub content: String,
    /// JSON list of retrieved contexts (assistant rows only).
    pub retrieved_contexts: Option<serde_json::Value>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub feedback: Option<i64>,
    pub feedback_comment: Option<String>,
    pub retrieval_time_ms: i64,
    pub generation_time_ms: i64,
    pub total_time_ms: i64,
    pub created_at: String,
}

/// Token usage persisted with an assistant message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MessageUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Wall-clock metrics persisted with an assistant message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeMetrics {
    pub retrieval_time_ms: i64,
    pub generation_time_ms: i64,
    pub total_time_ms: i64,
}
