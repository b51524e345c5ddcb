use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lore_bus::{Bus, RecallQuery, RecallTestJob, TOPIC_RECALL_TEST};
use lore_cache::CacheStore;
use lore_store::types::Robot;
use lore_store::RobotStore;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, RetrievalError};
use crate::hybrid::Retriever;

const TASK_TTL: Duration = Duration::from_secs(3600);
const MAX_QUERIES: usize = 5000;
const MAX_TOP_N: usize = 100;
/// Progress is persisted every this many queries, and at completion.
const PROGRESS_EVERY: usize = 10;

fn task_key(task_id: &str) -> String {
    format!("rag:recall:{}", task_id)
}

/// Batch retrieval-quality evaluation request.
#[derive(Debug, Clone, Deserialize)]
pub struct RecallRequest {
    pub queries: Vec<RecallQuery>,
    #[serde(rename = "topN", default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    pub knowledge_ids: Vec<i64>,
    #[serde(default)]
    pub robot_id: Option<i64>,
}

fn default_top_n() -> usize {
    10
}
fn default_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize)]
struct QueryResult {
    query: String,
    recall: f64,
    precision: f64,
    f1: f64,
    top_n_hit: bool,
    retrieved_docs: Vec<serde_json::Value>,
    expected_doc_ids: Vec<i64>,
    latency: f64,
}

/// Offline recall evaluator: HTTP enqueues, the worker consumes, progress
/// and results live in the cache under the task key. Deleting the task key
/// cancels the job; the worker notices at its next progress write.
pub struct RecallRunner {
    pub bus: Arc<Bus>,
    pub cache: Arc<CacheStore>,
    pub robots: Arc<RobotStore>,
    pub retriever: Arc<Retriever>,
}

impl RecallRunner {
    /// Validate, record the pending task, and enqueue the job.
    pub fn start(&self, request: RecallRequest, user_id: i64) -> Result<String> {
        if request.queries.is_empty() || request.queries.len() > MAX_QUERIES {
            return Err(RetrievalError::Validation(format!(
                "queries must contain between 1 and {} entries",
                MAX_QUERIES
            )));
        }
        if request.top_n == 0 || request.top_n > MAX_TOP_N {
            return Err(RetrievalError::Validation(format!(
                "topN must be in [1, {}]",
                MAX_TOP_N
            )));
        }
        if !(0.0..=1.0).contains(&request.threshold) {
            return Err(RetrievalError::Validation(
                "threshold must be in [0, 1]".to_string(),
            ));
        }
        if request.knowledge_ids.is_empty() {
            return Err(RetrievalError::Validation(
                "knowledge_ids must not be empty".to_string(),
            ));
        }

        let task_id = Uuid::new_v4().to_string();
        self.cache.set_json(
            &task_key(&task_id),
            &serde_json::json!({
                "taskId": task_id,
                "status": "pending",
                "progress": 0.0,
                "queries_total": request.queries.len(),
                "start_time": chrono::Utc::now().timestamp_millis(),
                "user_id": user_id,
            }),
            TASK_TTL,
        );

        self.bus.publish(
            TOPIC_RECALL_TEST,
            &RecallTestJob {
                task_id: task_id.clone(),
                queries: request.queries,
                top_n: request.top_n,
                threshold: request.threshold,
                knowledge_ids: request.knowledge_ids,
                robot_id: request.robot_id,
                user_id,
            },
        )?;

        info!(%task_id, "recall test task queued");
        Ok(task_id)
    }

    /// Task state for polling, with the remaining-time estimate derived
    /// from elapsed wall clock and progress.
    pub fn status(&self, task_id: &str) -> Option<serde_json::Value> {
        let mut task = self.cache.get_json(&task_key(task_id))?;

        let status = task["status"].as_str().unwrap_or_default().to_string();
        let progress = task["progress"].as_f64().unwrap_or(0.0);
        if status == "running" && progress > 0.0 {
            let start_ms = task["start_time"].as_i64().unwrap_or(0);
            let elapsed = (chrono::Utc::now().timestamp_millis() - start_ms) as f64 / 1000.0;
            let remaining = (elapsed * (100.0 / progress - 1.0)).max(0.0);
            task["estimated_remaining_time"] = serde_json::json!(remaining);
        }
        Some(task)
    }

    /// Claim the recall topic and run jobs as they arrive.
    pub fn spawn_worker(self: Arc<Self>) -> std::result::Result<(), lore_bus::BusError> {
        let mut rx = self.bus.subscribe(TOPIC_RECALL_TEST)?;
        tokio::spawn(async move {
            info!("recall worker started");
            while let Some(value) = rx.recv().await {
                let Some(job) = lore_bus::decode::<RecallTestJob>(TOPIC_RECALL_TEST, value) else {
                    continue;
                };
                let task_id = job.task_id.clone();
                if let Err(e) = self.run(job).await {
                    error!(%task_id, error = %e, "recall test task failed");
                    self.cache.merge_json(
                        &task_key(&task_id),
                        serde_json::json!({ "status": "failed", "error": e.to_string() }),
                        TASK_TTL,
                    );
                }
            }
        });
        Ok(())
    }

    async fn run(&self, job: RecallTestJob) -> Result<()> {
        let key = task_key(&job.task_id);
        self.cache.merge_json(
            &key,
            serde_json::json!({
                "status": "running",
                "start_time": chrono::Utc::now().timestamp_millis(),
            }),
            TASK_TTL,
        );

        let robot = self.resolve_robot(&job);
        let total = job.queries.len();
        let mut results: Vec<QueryResult> = Vec::with_capacity(total);
        let mut hit_count = 0usize;
        let mut total_latency = 0.0f64;

        for (i, q) in job.queries.iter().enumerate() {
            let started = std::time::Instant::now();
            let retrieved = self
                .retriever
                .hybrid_retrieve(&robot, &job.knowledge_ids, &q.query, job.top_n)
                .await?;
            let latency = started.elapsed().as_secs_f64();
            total_latency += latency;

            let result = score_query(q, &retrieved, job.threshold, latency);
            if result.top_n_hit {
                hit_count += 1;
            }
            results.push(result);

            let done = i + 1;
            if done % PROGRESS_EVERY == 0 || done == total {
                let progress = (done as f64 / total as f64) * 100.0;
                // A vanished task key means the job was cancelled.
                if !self.cache.merge_json(
                    &key,
                    serde_json::json!({ "progress": progress }),
                    TASK_TTL,
                ) {
                    warn!(task_id = %job.task_id, "recall task cancelled, stopping");
                    return Ok(());
                }
            }
        }

        let denom = total.max(1) as f64;
        let summary = serde_json::json!({
            "avg_recall": results.iter().map(|r| r.recall).sum::<f64>() / denom,
            "avg_precision": results.iter().map(|r| r.precision).sum::<f64>() / denom,
            "avg_f1": results.iter().map(|r| r.f1).sum::<f64>() / denom,
            "top_n_hit_rate": hit_count as f64 / denom,
            "avg_latency": total_latency / denom,
        });

        self.cache.merge_json(
            &key,
            serde_json::json!({
                "status": "finished",
                "progress": 100.0,
                "results": results,
                "summary": summary,
            }),
            TASK_TTL,
        );
        info!(task_id = %job.task_id, total, "recall test finished");
        Ok(())
    }

    /// A configured robot when given, else a plain no-rerank profile.
    fn resolve_robot(&self, job: &RecallTestJob) -> Robot {
        if let Some(id) = job.robot_id {
            if let Ok(robot) = self.robots.get(id) {
                return robot;
            }
        }
        Robot {
            id: 0,
            user_id: job.user_id,
            name: "recall-test".to_string(),
            description: None,
            chat_llm_id: 0,
            rerank_llm_id: None,
            enable_rerank: false,
            top_k: job.top_n as i64,
            temperature: 0.7,
            max_tokens: 2000,
            system_prompt: String::new(),
            created_at: String::new(),
        }
    }
}

/// Per-query metrics. With expectations: recall/precision/F1 over the
/// threshold-filtered document set, hit = any expected doc anywhere in the
/// unfiltered list. Without expectations: hit iff anything survived the
/// threshold, and the ratio metrics mirror the hit.
fn score_query(
    q: &RecallQuery,
    retrieved: &[crate::types::RetrievedContext],
    threshold: f64,
    latency: f64,
) -> QueryResult {
    let expected = q.expected_doc_ids.clone().unwrap_or_default();
    let filtered_ids: Vec<i64> = retrieved
        .iter()
        .filter(|c| c.score >= threshold)
        .map(|c| c.document_id)
        .collect();

    let (recall, precision, f1, top_n_hit) = if !expected.is_empty() {
        let filtered_set: HashSet<i64> = filtered_ids.iter().copied().collect();
        let expected_set: HashSet<i64> = expected.iter().copied().collect();
        let hits = filtered_set.intersection(&expected_set).count() as f64;

        let recall = hits / expected_set.len() as f64;
        let precision = if filtered_ids.is_empty() {
            0.0
        } else {
            hits / filtered_ids.len() as f64
        };
        let f1 = if recall + precision > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let all_ids: HashSet<i64> = retrieved.iter().map(|c| c.document_id).collect();
        let hit = expected.iter().any(|id| all_ids.contains(id));
        (recall, precision, f1, hit)
    } else {
        let hit = !filtered_ids.is_empty();
        let unit = if hit { 1.0 } else { 0.0 };
        (unit, unit, unit, hit)
    };

    QueryResult {
        query: q.query.clone(),
        recall,
        precision,
        f1,
        top_n_hit,
        retrieved_docs: retrieved
            .iter()
            .map(|c| {
                let preview: String = c.content.chars().take(200).collect();
                let truncated = c.content.chars().count() > 200;
                serde_json::json!({
                    "document_id": c.document_id,
                    "filename": c.filename,
                    "score": c.score,
                    "content": if truncated { format!("{}...", preview) } else { preview },
                })
            })
            .collect(),
        expected_doc_ids: expected,
        latency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetrievedContext;

    fn ctx(document_id: i64, score: f64) -> RetrievedContext {
        RetrievedContext {
            chunk_id: format!("{}_0", document_id),
            document_id,
            filename: "f.txt".to_string(),
            content: "content".to_string(),
            score,
            source: "hybrid".to_string(),
        }
    }

    fn query(expected: Option<Vec<i64>>) -> RecallQuery {
        RecallQuery {
            query: "q".to_string(),
            expected_doc_ids: expected,
        }
    }

    #[test]
    fn perfect_hit_scores_ones() {
        let result = score_query(&query(Some(vec![1])), &[ctx(1, 0.8)], 0.7, 0.01);
        assert_eq!(result.recall, 1.0);
        assert_eq!(result.precision, 1.0);
        assert_eq!(result.f1, 1.0);
        assert!(result.top_n_hit);
    }

    #[test]
    fn below_threshold_docs_still_count_for_top_n_hit() {
        let result = score_query(&query(Some(vec![1])), &[ctx(1, 0.3)], 0.7, 0.01);
        assert_eq!(result.recall, 0.0);
        assert_eq!(result.precision, 0.0);
        assert!(result.top_n_hit);
    }

    #[test]
    fn partial_overlap_computes_harmonic_mean() {
        let retrieved = vec![ctx(1, 0.9), ctx(2, 0.9)];
        let result = score_query(&query(Some(vec![1, 3])), &retrieved, 0.5, 0.01);
        assert_eq!(result.recall, 0.5);
        assert_eq!(result.precision, 0.5);
        assert!((result.f1 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn no_expectations_mirror_the_hit() {
        let hit = score_query(&query(None), &[ctx(1, 0.9)], 0.5, 0.01);
        assert_eq!((hit.recall, hit.precision, hit.f1), (1.0, 1.0, 1.0));
        assert!(hit.top_n_hit);

        let miss = score_query(&query(None), &[ctx(1, 0.2)], 0.5, 0.01);
        assert_eq!((miss.recall, miss.precision, miss.f1), (0.0, 0.0, 0.0));
        assert!(!miss.top_n_hit);
    }

    #[test]
    fn long_content_is_previewed() {
        let mut c = ctx(1, 0.9);
        c.content = "y".repeat(500);
        let result = score_query(&query(None), &[c], 0.5, 0.01);
        let preview = result.retrieved_docs[0]["content"].as_str().unwrap();
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 203);
    }
}
