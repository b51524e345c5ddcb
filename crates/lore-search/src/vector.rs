use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointStruct, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{Result, SearchError};
use crate::ChunkRecord;

/// Preview payload is capped at 1900 UTF-8 bytes so the stored field never
/// exceeds its 2000-char schema slot.
const PREVIEW_MAX_BYTES: usize = 1900;

/// One neighbor from a collection search, score normalized to [0, 1].
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: i64,
    pub chunk_index: i64,
    pub content_preview: String,
    pub score: f64,
}

/// Vector store adapter. Collections are per knowledge base; points carry
/// the chunk identity as payload so deletion by document is a filter.
pub struct VectorStore {
    client: Qdrant,
    url: String,
}

impl VectorStore {
    pub fn connect(url: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| SearchError::Vector {
                op: "connect",
                collection: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn health_check(&self) -> Result<()> {
        self.client
            .health_check()
            .await
            .map_err(|e| SearchError::Vector {
                op: "health",
                collection: self.url.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Create a collection for a knowledge base. Idempotent.
    pub async fn create_collection(&self, name: &str, dim: u64, _description: &str) -> Result<()> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| SearchError::Vector {
                op: "exists",
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        if exists {
            return Ok(());
        }

        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dim, Distance::Cosine))
                    .on_disk_payload(true),
            )
            .await
            .map_err(|e| SearchError::Vector {
                op: "create",
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        info!(collection = name, dim, "created vector collection");
        Ok(())
    }

    /// Deterministic point id per chunk: re-ingesting a document upserts the
    /// same points instead of accumulating duplicates.
    fn point_id(record: &ChunkRecord) -> u64 {
        ((record.document_id as u64) << 24) | (record.chunk_index as u64 & 0xFF_FFFF)
    }

    pub async fn insert_vectors(&self, name: &str, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = chunks
            .iter()
            .map(|record| {
                let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
                payload.insert("chunk_id".to_string(), record.chunk_id.clone().into());
                payload.insert("document_id".to_string(), record.document_id.into());
                payload.insert("knowledge_id".to_string(), record.knowledge_id.into());
                payload.insert("chunk_index".to_string(), record.chunk_index.into());
                payload.insert(
                    "content_preview".to_string(),
                    truncate_utf8(&record.content, PREVIEW_MAX_BYTES).into(),
                );
                PointStruct::new(Self::point_id(record), record.vector.clone(), payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(name, points).wait(true))
            .await
            .map_err(|e| SearchError::Vector {
                op: "upsert",
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        debug!(collection = name, count = chunks.len(), "upserted vectors");
        Ok(())
    }

    /// Nearest neighbors with scores mapped from [-1, 1] to [0, 1].
    pub async fn search_vectors(
        &self,
        name: &str,
        query_vector: Vec<f32>,
        top_k: usize,
        document_ids: Option<&[i64]>,
    ) -> Result<Vec<VectorHit>> {
        let mut builder =
            SearchPointsBuilder::new(name, query_vector, top_k as u64).with_payload(true);
        if let Some(ids) = document_ids {
            let conditions: Vec<Condition> = ids
                .iter()
                .map(|id| Condition::matches("document_id", *id))
                .collect();
            builder = builder.filter(Filter::should(conditions));
        }

        let result = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| SearchError::Vector {
                op: "search",
                collection: name.to_string(),
                message: e.to_string(),
            })?;

        Ok(result
            .result
            .into_iter()
            .map(|point| {
                let get_str = |key: &str| {
                    point
                        .payload
                        .get(key)
                        .and_then(|v| v.as_str().map(|s| s.to_string()))
                        .unwrap_or_default()
                };
                let get_int = |key: &str| {
                    point
                        .payload
                        .get(key)
                        .and_then(|v| v.as_integer())
                        .unwrap_or_default()
                };
                VectorHit {
                    chunk_id: get_str("chunk_id"),
                    document_id: get_int("document_id"),
                    chunk_index: get_int("chunk_index"),
                    content_preview: get_str("content_preview"),
                    score: normalize_score(point.score),
                }
            })
            .collect())
    }

    /// Remove every point belonging to a document.
    pub async fn delete_by_document(&self, name: &str, document_id: i64) -> Result<()> {
        let filter = Filter::must([Condition::matches("document_id", document_id)]);
        self.client
            .delete_points(DeletePointsBuilder::new(name).points(filter).wait(true))
            .await
            .map_err(|e| SearchError::Vector {
                op: "delete",
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        debug!(collection = name, document_id, "deleted vectors for document");
        Ok(())
    }

    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| SearchError::Vector {
                op: "exists",
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        if !exists {
            return Ok(());
        }
        self.client
            .delete_collection(name)
            .await
            .map_err(|e| SearchError::Vector {
                op: "drop",
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        info!(collection = name, "dropped vector collection");
        Ok(())
    }

    pub async fn collection_stats(&self, name: &str) -> Result<Option<u64>> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(|e| SearchError::Vector {
                op: "exists",
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        if !exists {
            return Ok(None);
        }
        let count = self
            .client
            .count(CountPointsBuilder::new(name).exact(true))
            .await
            .map_err(|e| SearchError::Vector {
                op: "count",
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(count.result.map(|r| r.count))
    }
}

/// Inner-product/cosine distance lands in [-1, 1]; retrieval wants [0, 1].
pub fn normalize_score(distance: f32) -> f64 {
    ((distance as f64) + 1.0) / 2.0
}

/// Truncate to a UTF-8 byte budget without splitting a code point.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_normalization_maps_extremes() {
        assert!((normalize_score(1.0) - 1.0).abs() < 1e-9);
        assert!((normalize_score(-1.0)).abs() < 1e-9);
        assert!((normalize_score(0.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn utf8_truncation_respects_boundaries() {
        let text = "你好世界".repeat(300); // 3 bytes per char
        let cut = truncate_utf8(&text, 1900);
        assert!(cut.len() <= 1900);
        assert!(cut.chars().all(|c| c == '你' || c == '好' || c == '世' || c == '界'));

        let short = truncate_utf8("hello", 1900);
        assert_eq!(short, "hello");
    }

    #[test]
    fn point_ids_are_deterministic_and_distinct() {
        let record = |doc: i64, idx: i64| ChunkRecord {
            chunk_id: format!("{}_{}", doc, idx),
            document_id: doc,
            knowledge_id: 1,
            chunk_index: idx,
            content: String::new(),
            file_name: String::new(),
            vector: vec![],
        };
        let a = VectorStore::point_id(&record(7, 0));
        let b = VectorStore::point_id(&record(7, 1));
        let c = VectorStore::point_id(&record(8, 0));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, VectorStore::point_id(&record(7, 0)));
    }
}
