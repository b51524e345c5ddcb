use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::provider::{
    retry_after_ms, status_error, ChatRequest, ChatResponse, LlmProvider, ProviderError,
    RerankResult, Role,
};
use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamChunk, TokenUsage};

const DEFAULT_HOST: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini. Roles map assistant -> "model", content travels as
/// `parts[].text`, and the API key rides as a query parameter.
pub struct GoogleProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: Option<String>,
}

impl GoogleProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(30))
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            api_key,
            base_url,
        }
    }

    fn model_path(model: &str) -> String {
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        }
    }

    fn endpoint(&self, model: &str, action: &str) -> String {
        match &self.base_url {
            Some(url) => url.clone(),
            None => format!("{}/{}:{}", DEFAULT_HOST, Self::model_path(model), action),
        }
    }

    fn build_body(&self, req: &ChatRequest) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| {
                let role = if m.role == Role::User { "user" } else { "model" };
                serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation = serde_json::json!({
            "temperature": req.temperature,
            "maxOutputTokens": req.max_tokens,
        });
        for (k, v) in &req.extra_params {
            generation[k.as_str()] = v.clone();
        }

        serde_json::json!({ "contents": contents, "generationConfig": generation })
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let retry_after = retry_after_ms(&resp);
        let body = resp.text().await.unwrap_or_default();
        Err(status_error("google", status, retry_after, body))
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = self.endpoint(&req.model, "generateContent");
        debug!(model = %req.model, "sending request to Gemini");

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&self.build_body(req))
            .send()
            .await?;
        let resp = self.check(resp).await?;

        let data: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let candidate = data
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Business("Gemini returned no candidates".to_string()))?;
        let content = candidate
            .content
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .unwrap_or_default();
        let usage = data.usage_metadata.unwrap_or_default();

        Ok(ChatResponse {
            content,
            role: "assistant".to_string(),
            model: req.model.clone(),
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
            reasoning_content: None,
            finish_reason: candidate.finish_reason,
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        use futures_util::StreamExt;

        let url = self.endpoint(&req.model, "streamGenerateContent");
        debug!(model = %req.model, "sending streaming request to Gemini");

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str()), ("alt", "sse")])
            .json(&self.build_body(req))
            .send()
            .await?;
        let resp = self.check(resp).await?;

        let mut lines = LineBuffer::new();
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
                    return Ok(());
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
                let Ok(frame) = serde_json::from_str::<GenerateResponse>(&data) else {
                    continue;
                };

                let usage = frame.usage_metadata.map(|u| TokenUsage {
                    prompt_tokens: u.prompt_token_count,
                    completion_tokens: u.candidates_token_count,
                    total_tokens: u.total_token_count,
                });

                let Some(candidate) = frame.candidates.into_iter().next() else {
                    if let Some(usage) = usage {
                        if tx
                            .send(StreamChunk {
                                usage: Some(usage),
                                ..Default::default()
                            })
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                    continue;
                };

                let delta = candidate
                    .content
                    .and_then(|c| c.parts.into_iter().next())
                    .and_then(|p| p.text)
                    .unwrap_or_default();
                let out = StreamChunk {
                    content_delta: delta,
                    reasoning_delta: None,
                    finish_reason: candidate.finish_reason,
                    usage,
                };
                if tx.send(out).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, ProviderError> {
        let model_path = Self::model_path(model);
        let url = match &self.base_url {
            Some(url) => url.clone(),
            None => format!("{}/{}:batchEmbedContents", DEFAULT_HOST, model_path),
        };
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": model_path,
                    "content": { "parts": [{ "text": t }] }
                })
            })
            .collect();

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await?;
        let resp = self.check(resp).await?;

        let data: BatchEmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(data.embeddings.into_iter().map(|e| e.values).collect())
    }

    async fn rerank(
        &self,
        _query: &str,
        _texts: &[String],
        _model: &str,
        _top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError> {
        Err(ProviderError::Unavailable(
            "Gemini does not expose a native rerank API".to_string(),
        ))
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Embedding>,
}

#[derive(Deserialize)]
struct Embedding {
    values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[test]
    fn assistant_role_becomes_model() {
        let provider = GoogleProvider::new("key".into(), None);
        let req = ChatRequest::new(
            "gemini-2.0-flash",
            vec![
                ChatMessage {
                    role: Role::User,
                    content: "q".to_string(),
                },
                ChatMessage {
                    role: Role::Assistant,
                    content: "a".to_string(),
                },
            ],
        );
        let body = provider.build_body(&req);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["text"], "a");
    }

    #[test]
    fn model_names_gain_prefix_once() {
        assert_eq!(
            GoogleProvider::model_path("gemini-2.0-flash"),
            "models/gemini-2.0-flash"
        );
        assert_eq!(
            GoogleProvider::model_path("models/gemini-2.0-flash"),
            "models/gemini-2.0-flash"
        );
    }
}
