//! The streaming chat wire protocol. Every frame goes out under the single
//! SSE event name `speech_type`; payloads are distinguished by a `type`
//! field. Frame order: searchGuid, one context per retrieved chunk, then
//! the token stream (reasoner/think for reasoning models, text otherwise),
//! a closing think frame when reasoning occurred, and exactly one finished
//! frame.

use lore_providers::{StreamChunk, TokenUsage};
use lore_retrieval::RetrievedContext;
use serde_json::json;

pub const SSE_EVENT: &str = "speech_type";

const QUOTE_MAX_CHARS: usize = 500;

/// Frames announcing the retrieved contexts, emitted before any token.
pub fn context_frames(contexts: &[RetrievedContext]) -> Vec<serde_json::Value> {
    if contexts.is_empty() {
        return Vec::new();
    }
    let mut frames = Vec::with_capacity(contexts.len() + 1);
    frames.push(json!({
        "type": "searchGuid",
        "title": format!("Citing {} reference passages", contexts.len()),
    }));
    for (idx, ctx) in contexts.iter().enumerate() {
        let quote: String = ctx.content.chars().take(QUOTE_MAX_CHARS).collect();
        frames.push(json!({
            "type": "context",
            "index": idx + 1,
            "docId": ctx.chunk_id,
            "title": ctx.filename,
            "url": "",
            "sourceType": "knowledge_base",
            "quote": quote,
            "publish_time": "",
            "icon_url": "",
            "web_site_name": "knowledge base",
            "ref_source_weight": (ctx.score * 5.0).floor() as i64,
            "content": ctx.content,
        }));
    }
    frames
}

/// Per-stream state machine:
/// `Idle -> SentContexts -> (Reasoning | Text) -> Text -> Finished`.
/// Feed provider chunks in arrival order; frames come out in wire order.
pub struct StreamEmitter {
    session_id: String,
    started_at: std::time::Instant,
    header_sent: bool,
    pub full_answer: String,
    pub full_reasoning: String,
    pub usage: TokenUsage,
    pub finished: bool,
}

impl StreamEmitter {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at: std::time::Instant::now(),
            header_sent: false,
            full_answer: String::new(),
            full_reasoning: String::new(),
            usage: TokenUsage::default(),
            finished: false,
        }
    }

    pub fn on_chunk(&mut self, chunk: StreamChunk) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();

        // Upstream failures arrive as error-finished chunks; surface the
        // message as a text frame and close out.
        if chunk.finish_reason.as_deref() == Some("error") {
            frames.push(json!({ "type": "text", "msg": chunk.content_delta }));
            frames.extend(self.finish_frames());
            return frames;
        }

        if let Some(reasoning) = &chunk.reasoning_delta {
            self.full_reasoning.push_str(reasoning);
            if !self.header_sent {
                frames.push(json!({ "type": "reasoner" }));
                self.header_sent = true;
            }
            frames.push(json!({
                "type": "think",
                "title": "Thinking...",
                "iconType": 9,
                "content": reasoning,
                "status": 1,
            }));
        }

        if !chunk.content_delta.is_empty() {
            self.full_answer.push_str(&chunk.content_delta);
            if !self.header_sent {
                // No reasoning seen: open the plain text stream.
                frames.push(json!({ "type": "text" }));
                self.header_sent = true;
            }
            frames.push(json!({ "type": "text", "msg": chunk.content_delta }));
        }

        if let Some(usage) = chunk.usage {
            self.usage = usage;
        }

        if chunk.finish_reason.is_some() {
            frames.extend(self.finish_frames());
        }
        frames
    }

    /// Closing think frame (only when reasoning occurred) plus the single
    /// finished frame. Idempotent: a second finish produces nothing.
    pub fn finish_frames(&mut self) -> Vec<serde_json::Value> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut frames = Vec::new();
        if !self.full_reasoning.is_empty() {
            let elapsed = self.started_at.elapsed().as_secs();
            frames.push(json!({
                "type": "think",
                "title": format!("Deep thinking finished ({}s)", elapsed),
                "iconType": 7,
                "content": "",
                "status": 2,
            }));
        }
        frames.push(json!({
            "type": "finished",
            "session_id": self.session_id,
            "token_usage": {
                "prompt_tokens": self.usage.prompt_tokens,
                "completion_tokens": self.usage.completion_tokens,
                "total_tokens": self.usage.total_tokens,
            },
            "full_answer": self.full_answer,
            "full_reasoning_content": self.full_reasoning,
        }));
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(delta: &str) -> StreamChunk {
        StreamChunk {
            content_delta: delta.to_string(),
            ..Default::default()
        }
    }

    fn reasoning(delta: &str) -> StreamChunk {
        StreamChunk {
            reasoning_delta: Some(delta.to_string()),
            ..Default::default()
        }
    }

    fn finish() -> StreamChunk {
        StreamChunk {
            finish_reason: Some("stop".to_string()),
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            ..Default::default()
        }
    }

    fn types(frames: &[serde_json::Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn plain_text_stream_shape() {
        let mut emitter = StreamEmitter::new("sid");
        let mut frames = Vec::new();
        frames.extend(emitter.on_chunk(content("Hel")));
        frames.extend(emitter.on_chunk(content("lo")));
        frames.extend(emitter.on_chunk(finish()));

        // header, two deltas, finished; no think frames
        assert_eq!(types(&frames), vec!["text", "text", "text", "finished"]);
        assert_eq!(frames[1]["msg"], "Hel");
        assert_eq!(emitter.full_answer, "Hello");

        let last = frames.last().unwrap();
        assert_eq!(last["session_id"], "sid");
        assert_eq!(last["token_usage"]["total_tokens"], 15);
        assert_eq!(last["full_answer"], "Hello");
    }

    #[test]
    fn reasoning_stream_shape() {
        let mut emitter = StreamEmitter::new("sid");
        let mut frames = Vec::new();
        frames.extend(emitter.on_chunk(reasoning("think1")));
        frames.extend(emitter.on_chunk(reasoning("think2")));
        frames.extend(emitter.on_chunk(content("answer")));
        frames.extend(emitter.on_chunk(finish()));

        let t = types(&frames);
        assert_eq!(t[0], "reasoner");
        assert_eq!(t[1], "think");
        assert_eq!(t[2], "think");
        assert_eq!(t[3], "text"); // the answer delta
        // closing think with status 2, then finished
        assert_eq!(t[t.len() - 2], "think");
        assert_eq!(frames[frames.len() - 2]["status"], 2);
        assert_eq!(*t.last().unwrap(), "finished");

        let last = frames.last().unwrap();
        assert_eq!(last["full_reasoning_content"], "think1think2");
        assert_eq!(last["full_answer"], "answer");
    }

    #[test]
    fn exactly_one_finished_frame() {
        let mut emitter = StreamEmitter::new("sid");
        let first = emitter.on_chunk(finish());
        assert_eq!(types(&first), vec!["finished"]);
        assert!(emitter.on_chunk(finish()).is_empty());
        assert!(emitter.finish_frames().is_empty());
    }

    #[test]
    fn upstream_error_surfaces_as_text_then_finished() {
        let mut emitter = StreamEmitter::new("sid");
        let _ = emitter.on_chunk(content("partial"));
        let frames = emitter.on_chunk(StreamChunk {
            content_delta: "stream error: connection reset".to_string(),
            finish_reason: Some("error".to_string()),
            ..Default::default()
        });
        assert_eq!(frames[0]["type"], "text");
        assert!(frames[0]["msg"].as_str().unwrap().contains("connection reset"));
        assert_eq!(frames.last().unwrap()["type"], "finished");
    }

    #[test]
    fn context_frames_follow_the_protocol() {
        let contexts = vec![RetrievedContext {
            chunk_id: "9_0".to_string(),
            document_id: 9,
            filename: "doc.pdf".to_string(),
            content: "z".repeat(600),
            score: 0.83,
            source: "hybrid".to_string(),
        }];
        let frames = context_frames(&contexts);
        assert_eq!(frames[0]["type"], "searchGuid");
        assert_eq!(frames[1]["type"], "context");
        assert_eq!(frames[1]["index"], 1);
        assert_eq!(frames[1]["docId"], "9_0");
        assert_eq!(frames[1]["quote"].as_str().unwrap().chars().count(), 500);
        assert_eq!(frames[1]["ref_source_weight"], 4); // floor(0.83 * 5)
        assert!(context_frames(&[]).is_empty());
    }
}
