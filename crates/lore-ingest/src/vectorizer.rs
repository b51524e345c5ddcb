use std::sync::Arc;

use lore_bus::DocChunks;
use lore_embed::LocalEmbedder;
use lore_providers::registry::build_provider;
use lore_search::{ChunkRecord, TextIndex, VectorStore};
use lore_store::types::DocumentStatus;
use lore_store::{DocumentStore, KnowledgeStore, LlmStore};
use tracing::{error, info, warn};

use crate::error::{IngestError, Result};

/// Stage C: embed chunks and fan them out to both stores.
///
/// The cross-store write is not a transaction. Idempotence comes from
/// deleting any prior rows for the document before writing, and failure
/// (or a document deleted mid-flight) compensates by deleting from both
/// stores again, so no partial chunks survive.
pub struct Vectorizer {
    pub documents: Arc<DocumentStore>,
    pub knowledge: Arc<KnowledgeStore>,
    pub llms: Arc<LlmStore>,
    pub vectors: Arc<VectorStore>,
    pub index: Arc<TextIndex>,
    pub embedder: Arc<LocalEmbedder>,
}

impl Vectorizer {
    pub async fn process(&self, msg: DocChunks) -> Result<()> {
        let doc_id = msg.document_id;
        info!(document_id = doc_id, chunks = msg.chunks.len(), "vectorizing document");

        if !self.documents.exists(doc_id)? {
            warn!(document_id = doc_id, "document vanished before embedding, skipping");
            return Ok(());
        }
        self.documents
            .set_status(doc_id, DocumentStatus::Embedding, None)?;

        let kb = self.knowledge.get(msg.knowledge_id)?;
        let collection = kb.vector_collection_name.clone();

        let embeddings = self.embed_chunks(&msg, kb.embed_llm_id).await?;

        let records: Vec<ChunkRecord> = msg
            .chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(idx, (content, vector))| ChunkRecord {
                chunk_id: ChunkRecord::make_chunk_id(doc_id, idx),
                document_id: doc_id,
                knowledge_id: msg.knowledge_id,
                chunk_index: idx as i64,
                content: content.clone(),
                file_name: msg.file_name.clone(),
                vector,
            })
            .collect();

        // Redelivery safety: clear whatever an earlier attempt wrote.
        self.cleanup(&collection, doc_id).await;

        if let Err(e) = self.vectors.insert_vectors(&collection, &records).await {
            self.cleanup(&collection, doc_id).await;
            return Err(e.into());
        }
        if let Err(e) = self.index.index_chunks(&records).await {
            self.cleanup(&collection, doc_id).await;
            return Err(e.into());
        }

        // The document may have been deleted while we were embedding.
        if !self.documents.exists(doc_id)? {
            warn!(document_id = doc_id, "document deleted mid-flight, removing its chunks");
            self.cleanup(&collection, doc_id).await;
            return Ok(());
        }

        self.documents.set_completed(doc_id, records.len() as i64)?;
        self.documents
            .recompute_knowledge_counters(msg.knowledge_id)?;
        info!(document_id = doc_id, chunks = records.len(), "document ingestion completed");
        Ok(())
    }

    /// Remote provider when the knowledge's embedding LLM has an endpoint,
    /// else the local model on the blocking pool.
    async fn embed_chunks(&self, msg: &DocChunks, embed_llm_id: i64) -> Result<Vec<Vec<f32>>> {
        let llm = self.llms.get(embed_llm_id)?;
        if let Some(base_url) = llm.base_url.clone().filter(|u| !u.is_empty()) {
            info!(model = %llm.model_name, "embedding via remote provider");
            let api_key = self.llms.active_api_key(llm.id)?.unwrap_or_default();
            let provider = build_provider(
                &llm.provider,
                api_key,
                Some(base_url),
                llm.api_version.clone(),
            );
            Ok(provider.embed(&msg.chunks, &llm.model_name).await?)
        } else {
            info!("embedding via local model");
            let embedder = self.embedder.clone();
            let chunks = msg.chunks.clone();
            tokio::task::spawn_blocking(move || embedder.encode_batch(&chunks))
                .await
                .map_err(|e| IngestError::Parse(format!("embedding task aborted: {}", e)))?
                .map_err(IngestError::from)
        }
    }

    /// Delete the document's rows from both stores, logging failures;
    /// cleanup must not mask the original error.
    pub async fn cleanup(&self, collection: &str, document_id: i64) {
        if let Err(e) = self.vectors.delete_by_document(collection, document_id).await {
            error!(document_id, error = %e, "vector cleanup failed");
        }
        if let Err(e) = self.index.delete_by_document(document_id).await {
            error!(document_id, error = %e, "index cleanup failed");
        }
    }
}
