use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::openai::{self, OpenAiProvider};
use crate::provider::{
    ChatRequest, ChatResponse, LlmProvider, ProviderError, RerankResult,
};
use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamChunk, TokenUsage};

const DEFAULT_URL: &str = "https://api.minimaxi.com/v1/text/chatcompletion_v2";
const MAX_ATTEMPTS: u32 = 3;
const BLOCKED_TEXT: &str = "[content blocked by safety policy]";
const EMPTY_STREAM_TEXT: &str = "[the model returned no content, try a different question or model]";

/// MiniMax with the hardening the plain OpenAI-compatible path lacks:
/// bounded retries, model-alias rewriting, `base_resp` business-error
/// detection, empty-content fallback and safety-filter surfacing. Embeds
/// the OpenAI variant for the calls that need no special handling.
pub struct MinimaxProvider {
    inner: OpenAiProvider,
    client: reqwest::Client,
    api_key: String,
    base_url: Option<String>,
}

impl MinimaxProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            inner: OpenAiProvider::tagged("minimax", api_key.clone(), base_url.clone()),
            // Streams get a tighter read budget than the generic client.
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(5))
                .read_timeout(std::time::Duration::from_secs(45))
                .build()
                .unwrap_or_default(),
            api_key,
            base_url,
        }
    }

    fn url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_URL)
    }

    /// The official host rejects a few community aliases for abab models.
    fn resolve_model<'a>(&self, model: &'a str) -> &'a str {
        if !self.url().contains("minimaxi.com") {
            return model;
        }
        match model.to_lowercase().as_str() {
            "minimax-2.1" | "minimax-m2.1" | "minimax/minimax-2.1" | "abab6.5" => "abab6.5s-chat",
            _ => model,
        }
    }

    async fn chat_once(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut body = self.inner.build_body(req, false);
        body["model"] = serde_json::json!(self.resolve_model(&req.model));
        body["tokens_to_generate"] = serde_json::json!(req.max_tokens);

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = self.inner.check_status(resp).await?;

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        if let Some(err) = business_error(&value) {
            warn!(error = %err, "MiniMax business error");
            return Err(ProviderError::Business(err));
        }

        let api_resp: openai::ApiResponse = serde_json::from_value(value)
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let parsed = openai::parse_response(api_resp, &req.model);

        if parsed.content.trim().is_empty() {
            if parsed.finish_reason.as_deref() == Some("content_filter") {
                return Ok(ChatResponse {
                    content: BLOCKED_TEXT.to_string(),
                    ..parsed
                });
            }
            warn!("MiniMax returned empty content");
            return Err(ProviderError::Parse("MiniMax reply was empty".to_string()));
        }
        Ok(parsed)
    }
}

fn business_error(value: &serde_json::Value) -> Option<String> {
    let base = value.get("base_resp")?;
    let code = base.get("status_code").and_then(|c| c.as_i64())?;
    if code == 0 {
        return None;
    }
    let msg = base
        .get("status_msg")
        .and_then(|m| m.as_str())
        .unwrap_or("unknown business error");
    Some(format!("status {}: {}", code, msg))
}

#[async_trait]
impl LlmProvider for MinimaxProvider {
    fn name(&self) -> &str {
        "minimax"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut backoff = std::time::Duration::from_secs(2);
        let mut last_err: Option<ProviderError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.chat_once(req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() || matches!(e, ProviderError::Parse(_)) => {
                    debug!(attempt, error = %e, "MiniMax attempt failed, retrying");
                    last_err = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(std::time::Duration::from_secs(10));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let err = last_err.expect("at least one attempt ran");
        warn!(error = %err, "MiniMax call failed after retries");
        Err(err)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        use futures_util::StreamExt;

        let mut body = self.inner.build_body(req, true);
        body["model"] = serde_json::json!(self.resolve_model(&req.model));
        body["tokens_to_generate"] = serde_json::json!(req.max_tokens);
        // The API rejects temperature 0 on the streaming path.
        body["temperature"] = serde_json::json!(req.temperature.max(0.01));

        debug!(model = %req.model, "sending streaming request to MiniMax");

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = self.inner.check_status(resp).await?;

        // MiniMax sometimes answers 200 with a plain JSON error object
        // instead of an event stream, so every line is inspected before the
        // SSE parse. One pass, no request replay.
        let mut lines = LineBuffer::new();
        let mut byte_stream = resp.bytes_stream();
        let mut has_content = false;

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "MiniMax stream transport error");
                    break 'outer;
                }
            };
            let text = match std::str::from_utf8(&chunk) {
                Ok(t) => t,
                Err(_) => continue,
            };

            for line in lines.push(text) {
                if line.starts_with('{') {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                        if let Some(err) = business_error(&value) {
                            let _ = tx
                                .send(StreamChunk {
                                    content_delta: format!("model call failed: {}", err),
                                    finish_reason: Some("error".to_string()),
                                    ..Default::default()
                                })
                                .await;
                            return Ok(());
                        }
                    }
                    continue;
                }

                let Some(SseParsed::Data(data)) = parse_sse_line(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }
                let Ok(frame) = serde_json::from_str::<serde_json::Value>(&data) else {
                    continue;
                };

                let usage = frame
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<TokenUsage>(u.clone()).ok());
                let Some(choice) = frame.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first())
                else {
                    if let Some(usage) = usage {
                        let _ = tx
                            .send(StreamChunk {
                                usage: Some(usage),
                                ..Default::default()
                            })
                            .await;
                    }
                    continue;
                };

                let delta = choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .and_then(|c| c.as_str())
                    .unwrap_or_default();
                let finish = choice
                    .get("finish_reason")
                    .and_then(|f| f.as_str())
                    .map(str::to_string);

                if !delta.is_empty() {
                    has_content = true;
                    if tx
                        .send(StreamChunk {
                            content_delta: delta.to_string(),
                            finish_reason: finish,
                            usage,
                            ..Default::default()
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                } else if finish.as_deref() == Some("content_filter") {
                    has_content = true;
                    let _ = tx
                        .send(StreamChunk {
                            content_delta: BLOCKED_TEXT.to_string(),
                            finish_reason: Some("content_filter".to_string()),
                            usage,
                            ..Default::default()
                        })
                        .await;
                } else if finish.is_some() || usage.is_some() {
                    if tx
                        .send(StreamChunk {
                            finish_reason: finish,
                            usage,
                            ..Default::default()
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }

        if !has_content {
            warn!("MiniMax stream yielded no content");
            let _ = tx
                .send(StreamChunk {
                    content_delta: EMPTY_STREAM_TEXT.to_string(),
                    finish_reason: Some("error".to_string()),
                    ..Default::default()
                })
                .await;
        }
        Ok(())
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.inner.embed(texts, model).await
    }

    async fn rerank(
        &self,
        query: &str,
        texts: &[String],
        model: &str,
        top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError> {
        self.inner.rerank(query, texts, model, top_n).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_rewrite_only_on_official_host() {
        let official = MinimaxProvider::new("k".into(), None);
        assert_eq!(official.resolve_model("minimax-2.1"), "abab6.5s-chat");
        assert_eq!(official.resolve_model("abab6.5s-chat"), "abab6.5s-chat");

        let proxy = MinimaxProvider::new(
            "k".into(),
            Some("https://proxy.example.com/v1/chat/completions".into()),
        );
        assert_eq!(proxy.resolve_model("minimax-2.1"), "minimax-2.1");
    }

    #[test]
    fn business_error_detection() {
        let ok = serde_json::json!({"base_resp": {"status_code": 0, "status_msg": "ok"}});
        assert!(business_error(&ok).is_none());

        let bad = serde_json::json!({"base_resp": {"status_code": 1008, "status_msg": "quota"}});
        let err = business_error(&bad).unwrap();
        assert!(err.contains("1008"));
        assert!(err.contains("quota"));

        let plain = serde_json::json!({"choices": []});
        assert!(business_error(&plain).is_none());
    }
}
