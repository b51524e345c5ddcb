//! Topic-keyed message bus for the ingestion pipeline and the recall
//! evaluator. Messages are JSON payloads on unbounded per-topic queues; one
//! consumer owns each topic (the in-process equivalent of a consumer
//! group). Stage handlers stay idempotent on `document_id`, so a redelivery
//! after a crash-and-retry converges to the same state.

use std::collections::HashMap;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stage handoff topics.
pub const TOPIC_DOC_UPLOAD: &str = "doc.upload";
pub const TOPIC_DOC_PARSED: &str = "doc.parsed";
pub const TOPIC_DOC_CHUNKS: &str = "doc.chunks";
pub const TOPIC_RECALL_TEST: &str = "recall.test";

/// Hard cap per message, matching the broker sizing the pipeline assumes.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("topic {0} already has a consumer")]
    AlreadySubscribed(String),

    #[error("topic {0} is closed")]
    Closed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct Bus {
    senders: DashMap<String, mpsc::UnboundedSender<serde_json::Value>>,
    /// Receivers created by an early publish, parked until a worker claims
    /// the topic.
    pending: Mutex<HashMap<String, mpsc::UnboundedReceiver<serde_json::Value>>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_topic(&self, topic: &str) {
        if self.senders.contains_key(topic) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(topic.to_string(), tx);
        self.pending.lock().unwrap().insert(topic.to_string(), rx);
    }

    /// Publish a payload. Messages sent before the consumer starts are
    /// buffered on the topic queue.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Result<(), BusError> {
        let value = serde_json::to_value(payload)?;
        let size = value.to_string().len();
        if size > MAX_MESSAGE_BYTES {
            return Err(BusError::TooLarge {
                size,
                max: MAX_MESSAGE_BYTES,
            });
        }

        self.ensure_topic(topic);
        let sender = self
            .senders
            .get(topic)
            .ok_or_else(|| BusError::Closed(topic.to_string()))?;
        sender
            .send(value)
            .map_err(|_| BusError::Closed(topic.to_string()))?;
        debug!(topic, size, "published message");
        Ok(())
    }

    /// Claim the consumer side of a topic. One consumer per topic; a second
    /// claim is a wiring bug and fails loudly.
    pub fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<serde_json::Value>, BusError> {
        self.ensure_topic(topic);
        self.pending
            .lock()
            .unwrap()
            .remove(topic)
            .ok_or_else(|| BusError::AlreadySubscribed(topic.to_string()))
    }
}

/// Decode one bus message into a stage payload, logging instead of
/// panicking on garbage; the bus redelivers nothing, so a poison message
/// is dropped with a trace.
pub fn decode<T: for<'de> Deserialize<'de>>(topic: &str, value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(topic, error = %e, "dropping undecodable bus message");
            None
        }
    }
}

// Stage payloads.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocUpload {
    pub document_id: i64,
    pub file_path: String,
    pub file_name: String,
    pub knowledge_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocParsed {
    pub document_id: i64,
    pub content: String,
    pub knowledge_id: i64,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocChunks {
    pub document_id: i64,
    pub chunks: Vec<String>,
    pub knowledge_id: i64,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallTestJob {
    pub task_id: String,
    pub queries: Vec<RecallQuery>,
    #[serde(rename = "topN")]
    pub top_n: usize,
    pub threshold: f64,
    pub knowledge_ids: Vec<i64>,
    pub robot_id: Option<i64>,
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallQuery {
    pub query: String,
    #[serde(default)]
    pub expected_doc_ids: Option<Vec<i64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_before_subscribe_is_buffered() {
        let bus = Bus::new();
        let payload = DocUpload {
            document_id: 1,
            file_path: "1/x.txt".into(),
            file_name: "x.txt".into(),
            knowledge_id: 2,
        };
        bus.publish(TOPIC_DOC_UPLOAD, &payload).unwrap();

        let mut rx = bus.subscribe(TOPIC_DOC_UPLOAD).unwrap();
        let value = rx.recv().await.unwrap();
        let decoded: DocUpload = decode(TOPIC_DOC_UPLOAD, value).unwrap();
        assert_eq!(decoded.document_id, 1);
        assert_eq!(decoded.knowledge_id, 2);
    }

    #[tokio::test]
    async fn second_subscriber_is_rejected() {
        let bus = Bus::new();
        let _rx = bus.subscribe(TOPIC_DOC_PARSED).unwrap();
        assert!(matches!(
            bus.subscribe(TOPIC_DOC_PARSED),
            Err(BusError::AlreadySubscribed(_))
        ));
    }

    #[test]
    fn oversized_messages_are_refused() {
        let bus = Bus::new();
        let huge = DocParsed {
            document_id: 1,
            content: "x".repeat(MAX_MESSAGE_BYTES + 1),
            knowledge_id: 1,
            file_name: "big.txt".into(),
        };
        assert!(matches!(
            bus.publish(TOPIC_DOC_PARSED, &huge),
            Err(BusError::TooLarge { .. })
        ));
    }

    #[test]
    fn decode_drops_garbage() {
        let garbage = serde_json::json!({"nope": true});
        let decoded: Option<DocUpload> = decode(TOPIC_DOC_UPLOAD, garbage);
        assert!(decoded.is_none());
    }
}
