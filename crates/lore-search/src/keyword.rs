use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SearchError};
use crate::ChunkRecord;

/// One BM25 hit, score normalized to [0, 1].
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub chunk_id: String,
    pub document_id: i64,
    pub knowledge_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub file_name: String,
    pub score: f64,
}

/// Hydrated chunk fetched by id.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub document_id: i64,
    pub knowledge_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub file_name: String,
}

/// Inverted-index adapter over the Elasticsearch REST API. Chunk content is
/// analyzed with a CJK-aware analyzer when the cluster has it; otherwise the
/// index is created with the standard analyzer and the adapter reports
/// itself degraded through the health surface.
pub struct TextIndex {
    client: reqwest::Client,
    host: String,
    index: String,
    degraded: AtomicBool,
}

impl TextIndex {
    pub fn new(host: &str, index: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(5))
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            host: host.trim_end_matches('/').to_string(),
            index: index.to_string(),
            degraded: AtomicBool::new(false),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.host, path)
    }

    /// True once the analyzer probe failed and the index fell back to the
    /// standard analyzer.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self.client.get(self.url("_cluster/health")).send().await?;
        if !resp.status().is_success() {
            return Err(SearchError::Index {
                op: "health",
                message: format!("cluster health returned {}", resp.status()),
            });
        }
        Ok(())
    }

    /// Boot-time probe: can the cluster analyze with `ik_max_word`?
    pub async fn probe_analyzer(&self) -> bool {
        let body = serde_json::json!({ "analyzer": "ik_max_word", "text": "分词器检查" });
        match self.client.post(self.url("_analyze")).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("CJK analyzer available");
                true
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "CJK analyzer probe failed, falling back to standard analyzer");
                self.degraded.store(true, Ordering::Relaxed);
                false
            }
            Err(e) => {
                warn!(error = %e, "analyzer probe request failed");
                self.degraded.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    fn mapping(&self, standard_fallback: bool) -> serde_json::Value {
        let (analyzer, search_analyzer) = if standard_fallback {
            ("standard", "standard")
        } else {
            ("ik_max_word_analyzer", "ik_smart_analyzer")
        };
        let mut settings = serde_json::json!({
            "number_of_shards": 3,
            "number_of_replicas": 1,
            "refresh_interval": "5s",
        });
        if !standard_fallback {
            settings["analysis"] = serde_json::json!({
                "analyzer": {
                    "ik_max_word_analyzer": { "type": "custom", "tokenizer": "ik_max_word" },
                    "ik_smart_analyzer": { "type": "custom", "tokenizer": "ik_smart" }
                }
            });
        }
        serde_json::json!({
            "settings": settings,
            "mappings": {
                "properties": {
                    "chunk_id": { "type": "keyword" },
                    "document_id": { "type": "long" },
                    "knowledge_id": { "type": "long" },
                    "chunk_index": { "type": "integer" },
                    "content": {
                        "type": "text",
                        "analyzer": analyzer,
                        "search_analyzer": search_analyzer
                    },
                    "metadata": {
                        "type": "object",
                        "properties": {
                            "file_name": { "type": "keyword" },
                            "heading": { "type": "text", "analyzer": search_analyzer }
                        }
                    },
                    "char_count": { "type": "integer" },
                    "created_at": { "type": "date" }
                }
            }
        })
    }

    /// Create the index when missing. A CJK-analyzer failure retries once
    /// with the standard analyzer and marks the adapter degraded.
    pub async fn ensure_index(&self) -> Result<()> {
        let head = self.client.head(self.url(&self.index)).send().await?;
        if head.status().is_success() {
            return Ok(());
        }

        let standard = self.is_degraded();
        let resp = self
            .client
            .put(self.url(&self.index))
            .json(&self.mapping(standard))
            .send()
            .await?;
        if resp.status().is_success() {
            info!(index = %self.index, standard_fallback = standard, "created chunk index");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        if !standard && body.contains("illegal_argument_exception") {
            warn!("CJK analyzer rejected at index creation, retrying with standard analyzer");
            self.degraded.store(true, Ordering::Relaxed);
            let retry = self
                .client
                .put(self.url(&self.index))
                .json(&self.mapping(true))
                .send()
                .await?;
            if retry.status().is_success() {
                return Ok(());
            }
            let retry_body = retry.text().await.unwrap_or_default();
            return Err(SearchError::Index {
                op: "create",
                message: retry_body,
            });
        }
        Err(SearchError::Index {
            op: "create",
            message: body,
        })
    }

    /// Bulk-index chunks; the chunk id doubles as the document id so
    /// re-ingestion overwrites in place.
    pub async fn index_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.ensure_index().await?;

        let now = chrono::Utc::now().to_rfc3339();
        let mut body = String::new();
        for chunk in chunks {
            let action = serde_json::json!({
                "index": { "_index": self.index, "_id": chunk.chunk_id }
            });
            let source = serde_json::json!({
                "chunk_id": chunk.chunk_id,
                "document_id": chunk.document_id,
                "knowledge_id": chunk.knowledge_id,
                "chunk_index": chunk.chunk_index,
                "content": chunk.content,
                "metadata": { "file_name": chunk.file_name },
                "char_count": chunk.content.chars().count(),
                "created_at": now,
            });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&source.to_string());
            body.push('\n');
        }

        let resp = self
            .client
            .post(self.url("_bulk"))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SearchError::Index {
                op: "bulk",
                message: text,
            });
        }

        let result: BulkResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        if result.errors {
            warn!("bulk indexing reported item-level errors");
            return Err(SearchError::Index {
                op: "bulk",
                message: "one or more chunks failed to index".to_string(),
            });
        }
        debug!(count = chunks.len(), "indexed chunks");
        Ok(())
    }

    /// BM25 search: `content` boosted 2x over headings, filtered to the
    /// given knowledge bases, scores normalized by s/(s+1).
    pub async fn search_chunks(
        &self,
        query: &str,
        knowledge_ids: &[i64],
        top_k: usize,
    ) -> Result<Vec<KeywordHit>> {
        self.ensure_index().await?;

        let body = serde_json::json!({
            "query": {
                "bool": {
                    "must": [{
                        "multi_match": {
                            "query": query,
                            "fields": ["content^2", "metadata.heading"],
                            "type": "best_fields"
                        }
                    }],
                    "filter": [{ "terms": { "knowledge_id": knowledge_ids } }]
                }
            },
            "size": top_k,
            "_source": ["chunk_id", "document_id", "knowledge_id", "chunk_index", "content", "metadata"]
        });

        let resp = self
            .client
            .post(self.url(&format!("{}/_search", self.index)))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SearchError::Index {
                op: "search",
                message: text,
            });
        }

        let result: SearchResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        Ok(result
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let score = hit.score.unwrap_or(0.0);
                KeywordHit {
                    chunk_id: hit.source.chunk_id,
                    document_id: hit.source.document_id,
                    knowledge_id: hit.source.knowledge_id,
                    chunk_index: hit.source.chunk_index,
                    content: hit.source.content,
                    file_name: hit.source.metadata.file_name,
                    score: normalize_bm25(score),
                }
            })
            .collect())
    }

    pub async fn get_chunk_by_id(&self, chunk_id: &str) -> Result<Option<StoredChunk>> {
        let chunks = self.get_chunks_by_ids(&[chunk_id.to_string()]).await?;
        Ok(chunks.into_iter().next())
    }

    /// Batch fetch (single mget); missing ids are silently absent from the
    /// result, callers preserve their own ordering.
    pub async fn get_chunks_by_ids(&self, chunk_ids: &[String]) -> Result<Vec<StoredChunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_index().await?;

        let resp = self
            .client
            .post(self.url(&format!("{}/_mget", self.index)))
            .json(&serde_json::json!({ "ids": chunk_ids }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SearchError::Index {
                op: "mget",
                message: text,
            });
        }

        let result: MgetResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        Ok(result
            .docs
            .into_iter()
            .filter(|doc| doc.found)
            .filter_map(|doc| doc.source)
            .map(|source| StoredChunk {
                chunk_id: source.chunk_id,
                document_id: source.document_id,
                knowledge_id: source.knowledge_id,
                chunk_index: source.chunk_index,
                content: source.content,
                file_name: source.metadata.file_name,
            })
            .collect())
    }

    pub async fn delete_by_document(&self, document_id: i64) -> Result<u64> {
        self.delete_by_term("document_id", document_id).await
    }

    pub async fn delete_by_knowledge(&self, knowledge_id: i64) -> Result<u64> {
        self.delete_by_term("knowledge_id", knowledge_id).await
    }

    async fn delete_by_term(&self, field: &str, value: i64) -> Result<u64> {
        self.ensure_index().await?;
        let body = serde_json::json!({ "query": { "term": { field: value } } });
        let resp = self
            .client
            .post(self.url(&format!("{}/_delete_by_query", self.index)))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SearchError::Index {
                op: "delete_by_query",
                message: text,
            });
        }
        let result: DeleteByQueryResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        debug!(field, value, deleted = result.deleted, "deleted chunks");
        Ok(result.deleted)
    }

    pub async fn count_by_knowledge(&self, knowledge_id: i64) -> Result<u64> {
        self.ensure_index().await?;
        let body = serde_json::json!({ "query": { "term": { "knowledge_id": knowledge_id } } });
        let resp = self
            .client
            .post(self.url(&format!("{}/_count", self.index)))
            .json(&body)
            .send()
            .await?;
        let result: CountResponse = resp
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        Ok(result.count)
    }
}

/// BM25 scores are unbounded; s/(s+1) squashes them into [0, 1).
pub fn normalize_bm25(score: f64) -> f64 {
    score / (score + 1.0)
}

// Elasticsearch wire types (private — deserialization only)

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: ChunkSource,
}

#[derive(Deserialize)]
struct ChunkSource {
    chunk_id: String,
    #[serde(default)]
    document_id: i64,
    #[serde(default)]
    knowledge_id: i64,
    #[serde(default)]
    chunk_index: i64,
    #[serde(default)]
    content: String,
    #[serde(default)]
    metadata: ChunkMetadata,
}

#[derive(Deserialize, Default)]
struct ChunkMetadata {
    #[serde(default = "unknown_file")]
    file_name: String,
}

fn unknown_file() -> String {
    "unknown".to_string()
}

#[derive(Deserialize)]
struct MgetResponse {
    #[serde(default)]
    docs: Vec<MgetDoc>,
}

#[derive(Deserialize)]
struct MgetDoc {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<ChunkSource>,
}

#[derive(Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: u64,
}

#[derive(Deserialize)]
struct CountResponse {
    #[serde(default)]
    count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bm25_normalization_is_bounded() {
        assert!((normalize_bm25(0.0)).abs() < 1e-9);
        assert!((normalize_bm25(1.0) - 0.5).abs() < 1e-9);
        assert!(normalize_bm25(1000.0) < 1.0);
        assert!(normalize_bm25(3.0) > normalize_bm25(2.0));
    }

    #[test]
    fn mapping_switches_analyzers_on_fallback() {
        let index = TextIndex::new("http://localhost:9200", "chunks");
        let cjk = index.mapping(false);
        assert_eq!(
            cjk["mappings"]["properties"]["content"]["analyzer"],
            "ik_max_word_analyzer"
        );
        assert!(cjk["settings"]["analysis"].is_object());

        let standard = index.mapping(true);
        assert_eq!(
            standard["mappings"]["properties"]["content"]["analyzer"],
            "standard"
        );
        assert!(standard["settings"].get("analysis").is_none());
    }

    #[test]
    fn degraded_flag_starts_clear() {
        let index = TextIndex::new("http://localhost:9200/", "chunks");
        assert!(!index.is_degraded());
        assert_eq!(index.url("_analyze"), "http://localhost:9200/_analyze");
    }
}
