use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError, RerankResult};
use crate::stream::StreamChunk;

/// Primary/fallback pair. Every call tries the primary first; on error the
/// same call is replayed against the fallback. For streams the handover only
/// happens when the primary failed before yielding its first chunk, so a
/// client never sees two interleaved answers.
pub struct FailoverProvider {
    primary: Box<dyn LlmProvider>,
    fallback: Box<dyn LlmProvider>,
}

impl FailoverProvider {
    pub fn new(primary: Box<dyn LlmProvider>, fallback: Box<dyn LlmProvider>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        match self.primary.chat(req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                warn!(primary = self.primary.name(), error = %e, "primary chat failed, switching to fallback");
                self.fallback.chat(req).await
            }
        }
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        // Tee the primary's output through a local channel so we know
        // whether anything was emitted before it failed.
        let (probe_tx, mut probe_rx) = mpsc::channel::<StreamChunk>(32);
        let mut emitted = false;

        let primary_fut = self.primary.chat_stream(req, probe_tx);
        tokio::pin!(primary_fut);

        let primary_result = loop {
            tokio::select! {
                chunk = probe_rx.recv() => match chunk {
                    Some(chunk) => {
                        emitted = true;
                        if tx.send(chunk).await.is_err() {
                            return Ok(()); // receiver dropped
                        }
                    }
                    // sender side closed; wait for the call result
                    None => break primary_fut.await,
                },
                result = &mut primary_fut => {
                    // drain whatever was buffered before the call returned
                    while let Some(chunk) = probe_rx.recv().await {
                        emitted = true;
                        if tx.send(chunk).await.is_err() {
                            return Ok(());
                        }
                    }
                    break result;
                }
            }
        };

        match primary_result {
            Ok(()) => Ok(()),
            Err(e) if !emitted => {
                warn!(primary = self.primary.name(), error = %e, "primary stream failed before first chunk, switching to fallback");
                self.fallback.chat_stream(req, tx).await
            }
            // Mid-stream failure: the client already saw primary output,
            // surface the error instead of splicing in a second answer.
            Err(e) => Err(e),
        }
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, ProviderError> {
        match self.primary.embed(texts, model).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(primary = self.primary.name(), error = %e, "primary embed failed, switching to fallback");
                self.fallback.embed(texts, model).await
            }
        }
    }

    async fn rerank(
        &self,
        query: &str,
        texts: &[String],
        model: &str,
        top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError> {
        match self.primary.rerank(query, texts, model, top_n).await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(primary = self.primary.name(), error = %e, "primary rerank failed, switching to fallback");
                self.fallback.rerank(query, texts, model, top_n).await
            }
        }
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.primary.count_tokens(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatMessage, Role};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyProvider {
        name: &'static str,
        fail: bool,
        chunks: Vec<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Unavailable("down".to_string()));
            }
            Ok(ChatResponse {
                content: format!("{} answered", self.name),
                role: "assistant".to_string(),
                model: req.model.clone(),
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
                reasoning_content: None,
                finish_reason: Some("stop".to_string()),
            })
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
            tx: mpsc::Sender<StreamChunk>,
        ) -> Result<(), ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Unavailable("down".to_string()));
            }
            for c in &self.chunks {
                let _ = tx
                    .send(StreamChunk {
                        content_delta: c.to_string(),
                        ..Default::default()
                    })
                    .await;
            }
            Ok(())
        }

        async fn embed(
            &self,
            _texts: &[String],
            _model: &str,
        ) -> Result<Vec<Vec<f32>>, ProviderError> {
            if self.fail {
                return Err(ProviderError::Unavailable("down".to_string()));
            }
            Ok(vec![vec![0.0]])
        }

        async fn rerank(
            &self,
            _query: &str,
            _texts: &[String],
            _model: &str,
            _top_n: usize,
        ) -> Result<Vec<RerankResult>, ProviderError> {
            Ok(vec![])
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new(
            "m",
            vec![ChatMessage {
                role: Role::User,
                content: "hi".to_string(),
            }],
        )
    }

    #[tokio::test]
    async fn chat_falls_back_on_primary_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failover = FailoverProvider::new(
            Box::new(FlakyProvider {
                name: "primary",
                fail: true,
                chunks: vec![],
                calls: calls.clone(),
            }),
            Box::new(FlakyProvider {
                name: "backup",
                fail: false,
                chunks: vec![],
                calls: calls.clone(),
            }),
        );
        let resp = failover.chat(&request()).await.unwrap();
        assert_eq!(resp.content, "backup answered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stream_hands_over_before_first_chunk() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failover = FailoverProvider::new(
            Box::new(FlakyProvider {
                name: "primary",
                fail: true,
                chunks: vec![],
                calls: calls.clone(),
            }),
            Box::new(FlakyProvider {
                name: "backup",
                fail: false,
                chunks: vec!["a", "b"],
                calls: calls.clone(),
            }),
        );
        let (tx, mut rx) = mpsc::channel(8);
        failover.chat_stream(&request(), tx).await.unwrap();

        let mut got = Vec::new();
        while let Some(chunk) = rx.recv().await {
            got.push(chunk.content_delta);
        }
        assert_eq!(got, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn stream_passes_primary_output_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failover = FailoverProvider::new(
            Box::new(FlakyProvider {
                name: "primary",
                fail: false,
                chunks: vec!["only"],
                calls: calls.clone(),
            }),
            Box::new(FlakyProvider {
                name: "backup",
                fail: false,
                chunks: vec!["never"],
                calls: calls.clone(),
            }),
        );
        let (tx, mut rx) = mpsc::channel(8);
        failover.chat_stream(&request(), tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.content_delta, "only");
        assert!(rx.recv().await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
