use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{
    retry_after_ms, status_error, ChatRequest, ChatResponse, LlmProvider, ProviderError,
    RerankResult,
};
use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamChunk, TokenUsage};

const DEFAULT_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_EMBED_URL: &str = "https://api.openai.com/v1/embeddings";

/// OpenAI and compatible vendors (DeepSeek, SiliconFlow, Moonshot, Zhipu,
/// Qwen, Doubao, ...). A configured LLM stores the full endpoint URL for
/// its capability; absent URLs fall back to the OpenAI defaults.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: Option<String>,
    provider_name: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self::tagged("openai", api_key, base_url)
    }

    /// Create a compatible provider under a different registry tag so logs
    /// and errors carry the real vendor name.
    pub fn tagged(name: impl Into<String>, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(30))
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key,
            base_url,
            provider_name: name.into(),
        }
    }

    fn chat_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_CHAT_URL)
    }

    pub(crate) fn build_body(&self, req: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "stream": stream,
        });
        if let Some(stop) = &req.stop {
            body["stop"] = serde_json::json!(stop);
        }
        // MiniMax-compatible endpoints ignore max_tokens and read this field.
        let url = self.chat_url().to_lowercase();
        if url.contains("minimax") || req.model.to_lowercase().contains("minimax") {
            body["tokens_to_generate"] = serde_json::json!(req.max_tokens);
        }
        for (k, v) in &req.extra_params {
            body[k.as_str()] = v.clone();
        }
        body
    }

    pub(crate) async fn check_status(
        &self,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let retry_after = retry_after_ms(&resp);
        let body = resp.text().await.unwrap_or_default();
        warn!(provider = %self.provider_name, status, body = %body, "chat API error");
        Err(status_error(&self.provider_name, status, retry_after, body))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_body(req, false);
        debug!(provider = %self.provider_name, model = %req.model, "sending chat request");

        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = self.check_status(resp).await?;

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp, &req.model))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        let body = self.build_body(req, true);
        debug!(provider = %self.provider_name, model = %req.model, "sending streaming chat request");

        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = self.check_status(resp).await?;

        pump_openai_stream(resp, tx).await;
        Ok(())
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = self.base_url.as_deref().unwrap_or(DEFAULT_EMBED_URL);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": model, "input": texts }))
            .send()
            .await?;
        let resp = self.check_status(resp).await?;

        let data: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn rerank(
        &self,
        query: &str,
        texts: &[String],
        model: &str,
        top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError> {
        // OpenAI itself has no rerank API; compatible vendors (SiliconFlow,
        // Jina, ...) expose one at the configured URL.
        let url = self.base_url.as_deref().ok_or_else(|| {
            ProviderError::Unavailable("rerank requires a configured endpoint".to_string())
        })?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": model,
                "query": query,
                "documents": texts,
                "top_n": top_n,
            }))
            .send()
            .await?;
        let resp = self.check_status(resp).await?;

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        parse_rerank_results(&value)
            .ok_or_else(|| ProviderError::Parse("unrecognised rerank response shape".to_string()))
    }
}

/// SiliconFlow wraps results in `results`, Jina in `data`; both carry
/// `index` + `relevance_score` per entry.
pub(crate) fn parse_rerank_results(value: &serde_json::Value) -> Option<Vec<RerankResult>> {
    let items = value
        .get("results")
        .or_else(|| value.get("data"))?
        .as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(i as u64) as usize;
        let relevance_score = item
            .get("relevance_score")
            .or_else(|| item.get("score"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        out.push(RerankResult {
            index,
            relevance_score,
        });
    }
    Some(out)
}

pub(crate) fn parse_response(resp: ApiResponse, fallback_model: &str) -> ChatResponse {
    let usage = resp.usage.unwrap_or_default();
    let choice = resp.choices.into_iter().next();
    let (content, role, reasoning, finish_reason) = match choice {
        Some(c) => (
            c.message.content.unwrap_or_default(),
            c.message.role.unwrap_or_else(|| "assistant".to_string()),
            c.message.reasoning_content,
            c.finish_reason,
        ),
        None => (String::new(), "assistant".to_string(), None, None),
    };

    ChatResponse {
        content,
        role,
        model: resp.model.unwrap_or_else(|| fallback_model.to_string()),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        reasoning_content: reasoning,
        finish_reason,
    }
}

/// Pump an OpenAI-style SSE body into StreamChunks. `data: [DONE]` ends the
/// stream; reasoning deltas arrive as `reasoning_content` or `reasoning`.
pub(crate) async fn pump_openai_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamChunk>) {
    use futures_util::StreamExt;

    let mut lines = LineBuffer::new();
    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamChunk {
                        finish_reason: Some("error".to_string()),
                        content_delta: format!("stream error: {}", e),
                        ..Default::default()
                    })
                    .await;
                return;
            }
        };
        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        for line in lines.push(text) {
            let Some(SseParsed::Data(data)) = parse_sse_line(&line) else {
                continue;
            };
            if data == "[DONE]" {
                break 'outer;
            }
            let Ok(frame) = serde_json::from_str::<StreamFrame>(&data) else {
                continue;
            };

            // Some vendors ship usage on a trailing choiceless frame.
            if frame.choices.is_empty() {
                if let Some(usage) = frame.usage {
                    if tx
                        .send(StreamChunk {
                            usage: Some(usage),
                            ..Default::default()
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                continue;
            }

            for choice in frame.choices {
                let reasoning = choice.delta.reasoning_content.or(choice.delta.reasoning);
                let out = StreamChunk {
                    content_delta: choice.delta.content.unwrap_or_default(),
                    reasoning_delta: reasoning.filter(|r| !r.is_empty()),
                    finish_reason: choice.finish_reason.filter(|r| !r.is_empty()),
                    usage: frame.usage,
                };
                if out.content_delta.is_empty()
                    && out.reasoning_delta.is_none()
                    && out.finish_reason.is_none()
                    && out.usage.is_none()
                {
                    continue;
                }
                if tx.send(out).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
    }
}

// OpenAI API response types — pub(crate) so the MiniMax variant can reuse.

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) model: Option<String>,
    #[serde(default)]
    pub(crate) choices: Vec<Choice>,
    pub(crate) usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ApiMessage,
    pub(crate) finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ApiMessage {
    pub(crate) role: Option<String>,
    pub(crate) content: Option<String>,
    pub(crate) reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;
    use crate::provider::Role;

    fn request() -> ChatRequest {
        ChatRequest::new(
            "gpt-4o-mini",
            vec![ChatMessage {
                role: Role::User,
                content: "hi".to_string(),
            }],
        )
    }

    #[test]
    fn body_carries_stop_and_extras() {
        let provider = OpenAiProvider::new("sk-test".into(), None);
        let mut req = request();
        req.stop = Some(vec!["END".to_string()]);
        req.extra_params
            .insert("top_p".to_string(), serde_json::json!(0.9));
        let body = provider.build_body(&req, true);
        assert_eq!(body["stream"], serde_json::json!(true));
        assert_eq!(body["stop"][0], "END");
        assert_eq!(body["top_p"], serde_json::json!(0.9));
        assert!(body.get("tokens_to_generate").is_none());
    }

    #[test]
    fn minimax_urls_get_tokens_to_generate() {
        let provider = OpenAiProvider::tagged(
            "minimax",
            "k".into(),
            Some("https://api.minimaxi.com/v1/text/chatcompletion_v2".into()),
        );
        let body = provider.build_body(&request(), false);
        assert_eq!(body["tokens_to_generate"], serde_json::json!(2000));
    }

    #[test]
    fn response_parse_handles_reasoning_and_usage() {
        let raw = serde_json::json!({
            "model": "deepseek-reasoner",
            "choices": [{
                "message": {"role": "assistant", "content": "4", "reasoning_content": "2+2"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 1, "total_tokens": 8}
        });
        let resp: ApiResponse = serde_json::from_value(raw).unwrap();
        let parsed = parse_response(resp, "fallback");
        assert_eq!(parsed.content, "4");
        assert_eq!(parsed.reasoning_content.as_deref(), Some("2+2"));
        assert_eq!(parsed.total_tokens, 8);
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn rerank_parse_accepts_both_envelopes() {
        let silicon = serde_json::json!({"results": [{"index": 2, "relevance_score": 0.9}]});
        let jina = serde_json::json!({"data": [{"index": 0, "score": 0.5}]});
        let a = parse_rerank_results(&silicon).unwrap();
        assert_eq!(a[0].index, 2);
        assert!((a[0].relevance_score - 0.9).abs() < 1e-9);
        let b = parse_rerank_results(&jina).unwrap();
        assert!((b[0].relevance_score - 0.5).abs() < 1e-9);
    }
}
