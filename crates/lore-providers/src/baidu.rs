use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{
    retry_after_ms, status_error, ChatRequest, ChatResponse, LlmProvider, ProviderError,
    RerankResult, Role,
};
use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamChunk, TokenUsage};

const TOKEN_URL: &str = "https://aip.baidubce.com/oauth/2.0/token";
const DEFAULT_CHAT_URL: &str =
    "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/completions_pro";
const DEFAULT_EMBED_URL: &str =
    "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop/embeddings/embedding-v1";

/// Baidu Ernie. API keys of the form `client_id:client_secret` are exchanged
/// for a short-lived access token before each call; anything else is treated
/// as an already-exchanged token.
pub struct BaiduProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: Option<String>,
}

impl BaiduProvider {
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

    async fn access_token(&self) -> Result<String, ProviderError> {
        let Some((client_id, client_secret)) = self.api_key.split_once(':') else {
            return Ok(self.api_key.clone());
        };

        let resp = self
            .client
            .get(TOKEN_URL)
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error("baidu", status, None, body));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        token.access_token.ok_or_else(|| {
            ProviderError::Auth {
                status: 401,
                message: "baidu: token exchange returned no access_token".to_string(),
            }
        })
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
            "messages": messages,
            "temperature": req.temperature,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }
        for (k, v) in &req.extra_params {
            body[k.as_str()] = v.clone();
        }
        body
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let retry_after = retry_after_ms(&resp);
        let body = resp.text().await.unwrap_or_default();
        warn!(status, body = %body, "Baidu API error");
        Err(status_error("baidu", status, retry_after, body))
    }
}

#[async_trait]
impl LlmProvider for BaiduProvider {
    fn name(&self) -> &str {
        "baidu"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let token = self.access_token().await?;
        let url = self.base_url.as_deref().unwrap_or(DEFAULT_CHAT_URL);
        debug!(model = %req.model, "sending request to Baidu");

        let resp = self
            .client
            .post(url)
            .query(&[("access_token", token.as_str())])
            .json(&self.build_body(req, false))
            .send()
            .await?;
        let resp = self.check(resp).await?;

        let data: ErnieResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        if let Some(code) = data.error_code {
            return Err(ProviderError::Business(format!(
                "baidu error {}: {}",
                code,
                data.error_msg.unwrap_or_default()
            )));
        }

        let usage = data.usage.unwrap_or_default();
        Ok(ChatResponse {
            content: data.result.unwrap_or_default(),
            role: "assistant".to_string(),
            model: req.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            reasoning_content: None,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        use futures_util::StreamExt;

        let token = self.access_token().await?;
        let url = self.base_url.as_deref().unwrap_or(DEFAULT_CHAT_URL);
        debug!(model = %req.model, "sending streaming request to Baidu");

        let resp = self
            .client
            .post(url)
            .query(&[("access_token", token.as_str())])
            .json(&self.build_body(req, true))
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
                let Ok(frame) = serde_json::from_str::<ErnieResponse>(&data) else {
                    continue;
                };
                if let Some(code) = frame.error_code {
                    warn!(code, "Baidu stream error");
                    let _ = tx
                        .send(StreamChunk {
                            finish_reason: Some("error".to_string()),
                            content_delta: frame.error_msg.unwrap_or_default(),
                            ..Default::default()
                        })
                        .await;
                    return Ok(());
                }

                let usage = frame.usage.map(|u| TokenUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                });
                let finish = if frame.is_end.unwrap_or(false) {
                    Some("stop".to_string())
                } else {
                    None
                };
                let out = StreamChunk {
                    content_delta: frame.result.unwrap_or_default(),
                    reasoning_delta: None,
                    finish_reason: finish,
                    usage,
                };
                if tx.send(out).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn embed(&self, texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>, ProviderError> {
        let token = self.access_token().await?;
        let url = self.base_url.as_deref().unwrap_or(DEFAULT_EMBED_URL);
        let resp = self
            .client
            .post(url)
            .query(&[("access_token", token.as_str())])
            .json(&serde_json::json!({ "input": texts }))
            .send()
            .await?;
        let resp = self.check(resp).await?;

        let data: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn rerank(
        &self,
        _query: &str,
        _texts: &[String],
        _model: &str,
        _top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError> {
        Err(ProviderError::Unavailable(
            "Baidu rerank is not wired into this adapter".to_string(),
        ))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct ErnieResponse {
    result: Option<String>,
    is_end: Option<bool>,
    usage: Option<ErnieUsage>,
    error_code: Option<i64>,
    error_msg: Option<String>,
}

#[derive(Deserialize, Default)]
struct ErnieUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
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

    #[test]
    fn system_moves_to_top_level_field() {
        let provider = BaiduProvider::new("id:secret".into(), None);
        let req = ChatRequest::new(
            "ernie-4.0",
            vec![
                ChatMessage {
                    role: Role::System,
                    content: "rules".to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: "hi".to_string(),
                },
            ],
        );
        let body = provider.build_body(&req, true);
        assert_eq!(body["system"], "rules");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["stream"], serde_json::json!(true));
    }

    #[test]
    fn is_end_maps_to_stop() {
        let frame: ErnieResponse =
            serde_json::from_str(r#"{"result":"done","is_end":true}"#).unwrap();
        assert!(frame.is_end.unwrap());
        assert_eq!(frame.result.as_deref(), Some("done"));
    }
}
