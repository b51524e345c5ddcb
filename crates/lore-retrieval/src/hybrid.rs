use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use lore_embed::{CrossEncoder, LocalEmbedder};
use lore_providers::registry::build_provider;
use lore_search::{TextIndex, VectorStore};
use lore_store::types::Robot;
use lore_store::{KnowledgeStore, LlmStore};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{LegHit, RetrievedContext};

/// RRF constant; fused score contribution is 1/(K + rank + 1) per leg.
const RRF_K: f64 = 60.0;

/// Recall breadth multiplier when a rerank pass will re-score the pool.
const RERANK_RECALL_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieverConfig {
    Vector,
    Keyword,
    Hybrid,
}

impl RetrieverConfig {
    pub fn parse(mode: &str) -> Self {
        match mode {
            "vector" => RetrieverConfig::Vector,
            "keyword" => RetrieverConfig::Keyword,
            _ => RetrieverConfig::Hybrid,
        }
    }
}

/// Hybrid retrieve-and-rerank engine: parallel vector + BM25 recall, RRF
/// fusion, mget hydration, optional remote or local rerank.
pub struct Retriever {
    pub knowledge: Arc<KnowledgeStore>,
    pub llms: Arc<LlmStore>,
    pub vectors: Arc<VectorStore>,
    pub index: Arc<TextIndex>,
    pub embedder: Arc<LocalEmbedder>,
    pub reranker: Arc<CrossEncoder>,
}

impl Retriever {
    /// The engine's public operation. Deterministic for fixed stores and a
    /// fixed embedding model: legs sort by score, fusion tie-breaks by leg
    /// priority (vector first), rerank tie-breaks by input order.
    pub async fn hybrid_retrieve(
        &self,
        robot: &Robot,
        knowledge_ids: &[i64],
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedContext>> {
        let recall_k = if robot.enable_rerank {
            top_k * RERANK_RECALL_FACTOR
        } else {
            top_k
        };

        let (vector_hits, keyword_hits) = tokio::join!(
            self.vector_retrieve(knowledge_ids, query, recall_k),
            self.keyword_retrieve(knowledge_ids, query, recall_k),
        );

        let mut merged = self.fuse_and_hydrate(vector_hits, keyword_hits, recall_k).await?;

        if robot.enable_rerank && !merged.is_empty() {
            merged = self.rerank(robot, query, merged, top_k).await?;
            return Ok(merged);
        }

        merged.truncate(top_k);
        Ok(merged)
    }

    /// Vector leg. Knowledge bases are grouped by their bound embedding
    /// model: a query vector is only comparable to a corpus encoded by the
    /// same model. Per-knowledge failures are logged and skipped; the leg
    /// itself never aborts retrieval.
    pub async fn vector_retrieve(
        &self,
        knowledge_ids: &[i64],
        query: &str,
        recall_k: usize,
    ) -> Vec<LegHit> {
        let knowledges = match self.knowledge.get_many(knowledge_ids) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "could not load knowledge bases for vector leg");
                return Vec::new();
            }
        };
        if knowledges.is_empty() {
            return Vec::new();
        }

        let mut groups: HashMap<i64, Vec<&lore_store::types::Knowledge>> = HashMap::new();
        for kb in &knowledges {
            groups.entry(kb.embed_llm_id).or_default().push(kb);
        }

        let mut all_hits: Vec<LegHit> = Vec::new();
        for (embed_llm_id, group) in groups {
            let query_vector = match self.encode_query(embed_llm_id, query).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(embed_llm_id, error = %e, "query encoding failed, skipping group");
                    continue;
                }
            };

            let searches = group.iter().map(|kb| {
                let collection = kb.vector_collection_name.clone();
                let vector = query_vector.clone();
                async move {
                    let result = self
                        .vectors
                        .search_vectors(&collection, vector, recall_k, None)
                        .await;
                    (kb.id, result)
                }
            });

            for (kb_id, result) in join_all(searches).await {
                match result {
                    Ok(hits) => {
                        all_hits.extend(hits.into_iter().map(|hit| LegHit {
                            chunk_id: hit.chunk_id,
                            document_id: hit.document_id,
                            score: hit.score,
                        }));
                    }
                    Err(e) => warn!(knowledge_id = kb_id, error = %e, "vector search failed"),
                }
            }
        }

        all_hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        all_hits.truncate(recall_k);
        all_hits
    }

    async fn encode_query(&self, embed_llm_id: i64, query: &str) -> Result<Vec<f32>> {
        if embed_llm_id > 0 {
            if let Ok(llm) = self.llms.get(embed_llm_id) {
                if let Some(base_url) = llm.base_url.clone().filter(|u| !u.is_empty()) {
                    debug!(model = %llm.model_name, "encoding query via remote provider");
                    let api_key = self.llms.active_api_key(llm.id)?.unwrap_or_default();
                    let provider = build_provider(
                        &llm.provider,
                        api_key,
                        Some(base_url),
                        llm.api_version.clone(),
                    );
                    let mut vectors = provider
                        .embed(&[query.to_string()], &llm.model_name)
                        .await?;
                    if let Some(v) = vectors.pop() {
                        return Ok(v);
                    }
                }
            }
        }
        debug!("encoding query via local model");
        let embedder = self.embedder.clone();
        let text = query.to_string();
        let encoded = tokio::task::spawn_blocking(move || embedder.encode(&text))
            .await
            .map_err(|e| {
                crate::error::RetrievalError::Validation(format!("encode task aborted: {}", e))
            })??;
        Ok(encoded)
    }

    /// Keyword leg: one filtered BM25 multi-match. Failures collapse to an
    /// empty leg.
    pub async fn keyword_retrieve(
        &self,
        knowledge_ids: &[i64],
        query: &str,
        recall_k: usize,
    ) -> Vec<LegHit> {
        match self.index.search_chunks(query, knowledge_ids, recall_k).await {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| LegHit {
                    chunk_id: hit.chunk_id,
                    document_id: hit.document_id,
                    score: hit.score,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "keyword retrieval failed");
                Vec::new()
            }
        }
    }

    /// Reciprocal rank fusion followed by one mget to attach content and
    /// filenames. Fused order is preserved through hydration; chunks gone
    /// from the index drop out.
    pub async fn fuse_and_hydrate(
        &self,
        vector_hits: Vec<LegHit>,
        keyword_hits: Vec<LegHit>,
        keep: usize,
    ) -> Result<Vec<RetrievedContext>> {
        let fused = rrf_merge(&vector_hits, &keyword_hits, keep);
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = fused.iter().map(|f| f.chunk_id.clone()).collect();
        let chunks = self.index.get_chunks_by_ids(&ids).await?;
        let by_id: HashMap<&str, &lore_search::keyword::StoredChunk> =
            chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();

        Ok(fused
            .into_iter()
            .filter_map(|f| {
                by_id.get(f.chunk_id.as_str()).map(|chunk| RetrievedContext {
                    chunk_id: f.chunk_id.clone(),
                    document_id: f.document_id,
                    filename: chunk.file_name.clone(),
                    content: chunk.content.clone(),
                    score: f.score,
                    source: f.source,
                })
            })
            .collect())
    }

    /// Hydrate single-leg results for the retrieval-test modes; scores are
    /// clamped into [0, 1].
    pub async fn hydrate_leg(
        &self,
        hits: Vec<LegHit>,
        source: &str,
    ) -> Result<Vec<RetrievedContext>> {
        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let chunks = self.index.get_chunks_by_ids(&ids).await?;
        let by_id: HashMap<&str, &lore_search::keyword::StoredChunk> =
            chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();

        Ok(hits
            .into_iter()
            .map(|hit| {
                let stored = by_id.get(hit.chunk_id.as_str());
                RetrievedContext {
                    chunk_id: hit.chunk_id.clone(),
                    document_id: hit.document_id,
                    filename: stored
                        .map(|c| c.file_name.clone())
                        .unwrap_or_else(|| "unknown".to_string()),
                    content: stored.map(|c| c.content.clone()).unwrap_or_default(),
                    score: hit.score.clamp(0.0, 1.0),
                    source: source.to_string(),
                }
            })
            .collect())
    }

    /// Remote rerank when the robot points at a rerank-capable LLM with an
    /// endpoint; otherwise the local cross-encoder on the blocking pool.
    /// Rerank scores replace fused scores.
    async fn rerank(
        &self,
        robot: &Robot,
        query: &str,
        merged: Vec<RetrievedContext>,
        top_k: usize,
    ) -> Result<Vec<RetrievedContext>> {
        let docs: Vec<String> = merged.iter().map(|c| c.content.clone()).collect();

        let remote_llm = match robot.rerank_llm_id {
            Some(id) => self
                .llms
                .get(id)
                .ok()
                .filter(|llm| llm.base_url.as_deref().is_some_and(|u| !u.is_empty())),
            None => None,
        };

        if let Some(llm) = remote_llm {
            info!(model = %llm.model_name, "reranking via remote provider");
            let api_key = self.llms.active_api_key(llm.id)?.unwrap_or_default();
            let provider = build_provider(
                &llm.provider,
                api_key,
                llm.base_url.clone(),
                llm.api_version.clone(),
            );
            let results = provider.rerank(query, &docs, &llm.model_name, top_k).await?;

            let mut out = Vec::with_capacity(results.len());
            for r in results {
                if let Some(ctx) = merged.get(r.index) {
                    let mut ctx = ctx.clone();
                    ctx.score = r.relevance_score.clamp(0.0, 1.0);
                    ctx.source = format!("{}+remote_rerank", ctx.source);
                    out.push(ctx);
                }
            }
            return Ok(out);
        }

        info!("reranking via local cross-encoder");
        let reranker = self.reranker.clone();
        let query = query.to_string();
        let ranked = tokio::task::spawn_blocking(move || reranker.rerank(&query, &docs))
            .await
            .map_err(|e| {
                crate::error::RetrievalError::Validation(format!("rerank task aborted: {}", e))
            })??;

        let mut out = Vec::with_capacity(top_k);
        for (idx, score) in ranked.into_iter().take(top_k) {
            if let Some(ctx) = merged.get(idx) {
                let mut ctx = ctx.clone();
                ctx.score = score.clamp(0.0, 1.0);
                ctx.source = format!("{}+local_rerank", ctx.source);
                out.push(ctx);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FusedHit {
    pub chunk_id: String,
    pub document_id: i64,
    pub score: f64,
    pub source: String,
}

/// Reciprocal rank fusion with k = 60. A chunk recalled by both legs is
/// tagged `hybrid` and accumulates both contributions; ties keep vector-leg
/// insertion order ahead of keyword-leg (stable sort).
pub(crate) fn rrf_merge(vector_hits: &[LegHit], keyword_hits: &[LegHit], keep: usize) -> Vec<FusedHit> {
    let mut order: Vec<String> = Vec::new();
    let mut fused: HashMap<String, FusedHit> = HashMap::new();

    for (rank, hit) in vector_hits.iter().enumerate() {
        let entry = fused.entry(hit.chunk_id.clone()).or_insert_with(|| {
            order.push(hit.chunk_id.clone());
            FusedHit {
                chunk_id: hit.chunk_id.clone(),
                document_id: hit.document_id,
                score: 0.0,
                source: "vector".to_string(),
            }
        });
        entry.score += 1.0 / (RRF_K + rank as f64 + 1.0);
    }

    for (rank, hit) in keyword_hits.iter().enumerate() {
        match fused.get_mut(&hit.chunk_id) {
            Some(entry) => {
                entry.source = "hybrid".to_string();
                entry.score += 1.0 / (RRF_K + rank as f64 + 1.0);
            }
            None => {
                order.push(hit.chunk_id.clone());
                fused.insert(
                    hit.chunk_id.clone(),
                    FusedHit {
                        chunk_id: hit.chunk_id.clone(),
                        document_id: hit.document_id,
                        score: 1.0 / (RRF_K + rank as f64 + 1.0),
                        source: "keyword".to_string(),
                    },
                );
            }
        }
    }

    let mut out: Vec<FusedHit> = order
        .into_iter()
        .filter_map(|id| fused.remove(&id))
        .collect();
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(keep);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: &str, document_id: i64, score: f64) -> LegHit {
        LegHit {
            chunk_id: chunk_id.to_string(),
            document_id,
            score,
        }
    }

    #[test]
    fn both_legs_beat_a_single_leg_at_rank_zero() {
        let vector = vec![hit("a_0", 1, 0.9)];
        let keyword = vec![hit("a_0", 1, 0.8)];
        let fused = rrf_merge(&vector, &keyword, 10);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].source, "hybrid");
        assert!((fused[0].score - 2.0 / 61.0).abs() < 1e-12);

        let single = rrf_merge(&vec![hit("b_0", 2, 0.99)], &[], 10);
        assert!(fused[0].score > single[0].score);
        assert!((single[0].score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn fused_scores_follow_rank_not_raw_score() {
        let vector = vec![hit("a_0", 1, 0.99), hit("b_0", 2, 0.98)];
        let keyword = vec![hit("b_0", 2, 0.10)];
        let fused = rrf_merge(&vector, &keyword, 10);
        // b appears in both legs, so it outranks a despite lower raw scores
        assert_eq!(fused[0].chunk_id, "b_0");
        assert_eq!(fused[0].source, "hybrid");
        assert_eq!(fused[1].chunk_id, "a_0");
        assert_eq!(fused[1].source, "vector");
    }

    #[test]
    fn ties_keep_vector_before_keyword() {
        // same rank in each leg, never overlapping: identical fused scores
        let vector = vec![hit("v_0", 1, 0.9)];
        let keyword = vec![hit("k_0", 2, 0.9)];
        let fused = rrf_merge(&vector, &keyword, 10);
        assert_eq!(fused[0].chunk_id, "v_0");
        assert_eq!(fused[1].chunk_id, "k_0");
        assert!((fused[0].score - fused[1].score).abs() < 1e-12);
    }

    #[test]
    fn keep_truncates_after_sorting() {
        let vector = vec![hit("a_0", 1, 0.9), hit("b_0", 2, 0.8), hit("c_0", 3, 0.7)];
        let keyword = vec![hit("c_0", 3, 0.9)];
        let fused = rrf_merge(&vector, &keyword, 2);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].chunk_id, "c_0"); // both legs
    }

    #[test]
    fn mode_parse_defaults_to_hybrid() {
        assert_eq!(RetrieverConfig::parse("vector"), RetrieverConfig::Vector);
        assert_eq!(RetrieverConfig::parse("keyword"), RetrieverConfig::Keyword);
        assert_eq!(RetrieverConfig::parse("anything"), RetrieverConfig::Hybrid);
    }
}
