use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::StreamChunk;

/// How much of a remote error body is kept in errors and logs.
const ERROR_SNAPSHOT_CHARS: usize = 2000;

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Request to an LLM vendor.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub stop: Option<Vec<String>>,
    /// Vendor-specific extras merged verbatim into the request body.
    pub extra_params: serde_json::Map<String, serde_json::Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            max_tokens: 2000,
            stream: false,
            stop: None,
            extra_params: serde_json::Map::new(),
        }
    }
}

/// Response from an LLM vendor (non-streaming).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub role: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub reasoning_content: Option<String>,
    pub finish_reason: Option<String>,
}

/// One scored document from a rerank call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f64,
}

/// Common interface for all LLM vendors (OpenAI-compatible, Anthropic,
/// Google, Baidu, MiniMax, ...).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider tag for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response chunks through a channel.
    /// Default: falls back to non-streaming chat, emits one chunk + finish.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        let resp = self.chat(req).await?;
        let _ = tx
            .send(StreamChunk {
                content_delta: resp.content,
                reasoning_delta: resp.reasoning_content,
                finish_reason: Some(resp.finish_reason.unwrap_or_else(|| "stop".to_string())),
                usage: Some(crate::stream::TokenUsage {
                    prompt_tokens: resp.prompt_tokens,
                    completion_tokens: resp.completion_tokens,
                    total_tokens: resp.total_tokens,
                }),
            })
            .await;
        Ok(())
    }

    /// Encode texts into vectors.
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Score documents against a query, best first.
    async fn rerank(
        &self,
        query: &str,
        texts: &[String],
        model: &str,
        top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError>;

    /// Cheap token estimate. CJK text runs roughly two chars per token,
    /// so the estimate leans on the UTF-8 overhead of the input.
    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars / 2 + (text.len() - chars) / 3
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("authentication rejected ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("provider business error: {0}")]
    Business(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Connection problems, 429s and 5xx responses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::RateLimited { .. } => true,
            ProviderError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Map a non-success HTTP response to the error taxonomy, keeping only a
/// truncated snapshot of the remote body.
pub(crate) fn status_error(provider: &str, status: u16, retry_after: Option<u64>, body: String) -> ProviderError {
    let message = format!("{}: {}", provider, truncate_snapshot(&body));
    match status {
        401 | 403 => ProviderError::Auth { status, message },
        429 => ProviderError::RateLimited {
            retry_after_ms: retry_after.unwrap_or(5000),
        },
        _ => ProviderError::Api { status, message },
    }
}

pub(crate) fn truncate_snapshot(body: &str) -> String {
    if body.chars().count() <= ERROR_SNAPSHOT_CHARS {
        return body.to_string();
    }
    let cut: String = body.chars().take(ERROR_SNAPSHOT_CHARS).collect();
    format!("{}…", cut)
}

/// Parse a Retry-After response header into milliseconds.
pub(crate) fn retry_after_ms(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|s| s * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_counts_cjk_heavier() {
        let ascii = estimate_tokens("hello world");
        let cjk = estimate_tokens("你好世界你好世界你好世");
        assert!(ascii >= 5);
        assert!(cjk > ascii);
    }

    #[test]
    fn status_error_maps_auth_and_rate_limit() {
        assert!(matches!(
            status_error("openai", 401, None, "no".into()),
            ProviderError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            status_error("openai", 429, Some(2000), "slow".into()),
            ProviderError::RateLimited {
                retry_after_ms: 2000
            }
        ));
        assert!(matches!(
            status_error("openai", 500, None, "boom".into()),
            ProviderError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn snapshot_is_truncated() {
        let long = "x".repeat(5000);
        let snap = truncate_snapshot(&long);
        assert!(snap.chars().count() <= 2001);
        assert!(snap.ends_with('…'));
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(ProviderError::RateLimited { retry_after_ms: 1 }.is_retryable());
        assert!(ProviderError::Api {
            status: 502,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Auth {
            status: 401,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Business(String::new()).is_retryable());
    }
}
