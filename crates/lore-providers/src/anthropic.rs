use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{
    retry_after_ms, status_error, ChatRequest, ChatResponse, LlmProvider, ProviderError,
    RerankResult, Role,
};
use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamChunk, TokenUsage};

const DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Claude. The system prompt is hoisted out of the message list
/// into the top-level `system` field; streams arrive as typed SSE events.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: Option<String>,
    api_version: Option<String>,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>, api_version: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(30))
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key,
            base_url,
            api_version,
        }
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut system = String::new();
        let mut messages: Vec<serde_json::Value> = Vec::new();
        for msg in &req.messages {
            if msg.role == Role::System {
                system = msg.content.clone();
            } else {
                messages.push(serde_json::json!({ "role": msg.role, "content": msg.content }));
            }
        }

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }
        if let Some(stop) = &req.stop {
            body["stop_sequences"] = serde_json::json!(stop);
        }
        for (k, v) in &req.extra_params {
            body[k.as_str()] = v.clone();
        }
        body
    }

    async fn send(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = self.base_url.as_deref().unwrap_or(DEFAULT_URL);
        let resp = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header(
                "anthropic-version",
                self.api_version.as_deref().unwrap_or(API_VERSION),
            )
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let retry_after = retry_after_ms(&resp);
        let text = resp.text().await.unwrap_or_default();
        warn!(status, body = %text, "Anthropic API error");
        Err(status_error("anthropic", status, retry_after, text))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        debug!(model = %req.model, "sending request to Anthropic");
        let resp = self.send(&self.build_body(req, false)).await?;

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let mut content = String::new();
        for block in &api_resp.content {
            if let ContentBlock::Text { text } = block {
                content.push_str(text);
            }
        }

        let prompt = api_resp.usage.input_tokens;
        let completion = api_resp.usage.output_tokens;
        Ok(ChatResponse {
            content,
            role: "assistant".to_string(),
            model: api_resp.model.unwrap_or_else(|| req.model.clone()),
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            reasoning_content: None,
            finish_reason: api_resp.stop_reason,
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        debug!(model = %req.model, "sending streaming request to Anthropic");
        let resp = self.send(&self.build_body(req, true)).await?;
        pump_stream(resp, tx).await;
        Ok(())
    }

    async fn embed(&self, _texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Unavailable(
            "Anthropic does not expose an embeddings API".to_string(),
        ))
    }

    async fn rerank(
        &self,
        _query: &str,
        _texts: &[String],
        _model: &str,
        _top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError> {
        Err(ProviderError::Unavailable(
            "Anthropic does not expose a rerank API".to_string(),
        ))
    }
}

/// Translate Anthropic's typed SSE events into StreamChunks.
async fn pump_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamChunk>) {
    use futures_util::StreamExt;

    let mut lines = LineBuffer::new();
    let mut current_event = String::new();
    let mut usage = TokenUsage::default();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
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
            match parse_sse_line(&line) {
                Some(SseParsed::Event(ev)) => current_event = ev,
                Some(SseParsed::Data(data)) => {
                    if let Some(out) = parse_event(&current_event, &data, &mut usage) {
                        if tx.send(out).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
                None => {}
            }
        }
    }
}

fn parse_event(event: &str, data: &str, usage: &mut TokenUsage) -> Option<StreamChunk> {
    match event {
        "message_start" => {
            if let Ok(start) = serde_json::from_str::<MessageStart>(data) {
                usage.prompt_tokens = start.message.usage.input_tokens;
            }
            None
        }
        "content_block_delta" => {
            let delta = serde_json::from_str::<BlockDelta>(data).ok()?;
            match delta.delta.delta_type.as_str() {
                "text_delta" => delta.delta.text.map(|text| StreamChunk {
                    content_delta: text,
                    ..Default::default()
                }),
                "thinking_delta" => delta.delta.thinking.map(|text| StreamChunk {
                    reasoning_delta: Some(text),
                    ..Default::default()
                }),
                _ => None,
            }
        }
        "message_delta" => {
            let delta = serde_json::from_str::<MessageDelta>(data).ok()?;
            usage.completion_tokens = delta.usage.output_tokens;
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
            Some(StreamChunk {
                finish_reason: delta.delta.stop_reason.or(Some("stop".to_string())),
                usage: Some(*usage),
                ..Default::default()
            })
        }
        "error" => Some(StreamChunk {
            finish_reason: Some("error".to_string()),
            content_delta: data.to_string(),
            ..Default::default()
        }),
        _ => None,
    }
}

// Anthropic API wire types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    #[serde(default)]
    input_tokens: u32,
}

#[derive(Deserialize)]
struct BlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[test]
    fn system_prompt_is_hoisted() {
        let provider = AnthropicProvider::new("key".into(), None, None);
        let req = ChatRequest::new(
            "claude-3-5-haiku",
            vec![
                ChatMessage {
                    role: Role::System,
                    content: "be brief".to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: "hi".to_string(),
                },
            ],
        );
        let body = provider.build_body(&req, false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn delta_events_map_to_chunks() {
        let mut usage = TokenUsage::default();
        let chunk = parse_event(
            "content_block_delta",
            r#"{"delta":{"type":"text_delta","text":"Hello"}}"#,
            &mut usage,
        )
        .unwrap();
        assert_eq!(chunk.content_delta, "Hello");

        let chunk = parse_event(
            "content_block_delta",
            r#"{"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            &mut usage,
        )
        .unwrap();
        assert_eq!(chunk.reasoning_delta.as_deref(), Some("hmm"));
    }

    #[test]
    fn message_delta_closes_with_usage() {
        let mut usage = TokenUsage {
            prompt_tokens: 10,
            ..Default::default()
        };
        let chunk = parse_event(
            "message_delta",
            r#"{"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
            &mut usage,
        )
        .unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(chunk.usage.unwrap().total_tokens, 15);
    }
}
