use std::sync::Arc;
use std::time::Duration;

use lore_bus::{Bus, DocChunks, DocParsed, DocUpload, TOPIC_DOC_CHUNKS, TOPIC_DOC_PARSED, TOPIC_DOC_UPLOAD};
use lore_store::types::DocumentStatus;
use lore_store::{DocumentStore, KnowledgeStore};
use tracing::{error, info, warn};

use crate::error::{IngestError, Result};
use crate::parser;
use crate::splitter::TextSplitter;
use crate::storage::FileStorage;
use crate::vectorizer::Vectorizer;

/// Budget for non-PDF formats; PDFs get the page-scaled budget.
const PARSE_BUDGET: Duration = Duration::from_secs(300);

/// Everything the three stage workers share.
pub struct Pipeline {
    pub bus: Arc<Bus>,
    pub storage: FileStorage,
    pub documents: Arc<DocumentStore>,
    pub knowledge: Arc<KnowledgeStore>,
    pub vectorizer: Arc<Vectorizer>,
    pub default_chunk_size: usize,
    pub default_chunk_overlap: usize,
}

impl Pipeline {
    /// Claim all three stage topics and spawn one consumer task each.
    /// At-least-once semantics: a handler error marks the document failed;
    /// the retry endpoint republished `doc.upload` resets the run.
    pub fn spawn(self: Arc<Self>) -> std::result::Result<(), lore_bus::BusError> {
        let mut upload_rx = self.bus.subscribe(TOPIC_DOC_UPLOAD)?;
        let mut parsed_rx = self.bus.subscribe(TOPIC_DOC_PARSED)?;
        let mut chunks_rx = self.bus.subscribe(TOPIC_DOC_CHUNKS)?;

        let parser = self.clone();
        tokio::spawn(async move {
            info!("parser worker started");
            while let Some(value) = upload_rx.recv().await {
                let Some(msg) = lore_bus::decode::<DocUpload>(TOPIC_DOC_UPLOAD, value) else {
                    continue;
                };
                let doc_id = msg.document_id;
                if let Err(e) = parser.handle_upload(msg).await {
                    parser.mark_failed(doc_id, &format!("parse failed: {}", e));
                }
            }
        });

        let splitter = self.clone();
        tokio::spawn(async move {
            info!("splitter worker started");
            while let Some(value) = parsed_rx.recv().await {
                let Some(msg) = lore_bus::decode::<DocParsed>(TOPIC_DOC_PARSED, value) else {
                    continue;
                };
                let doc_id = msg.document_id;
                if let Err(e) = splitter.handle_parsed(msg).await {
                    splitter.mark_failed(doc_id, &format!("split failed: {}", e));
                }
            }
        });

        let vectorizer = self;
        tokio::spawn(async move {
            info!("vectorizer worker started");
            while let Some(value) = chunks_rx.recv().await {
                let Some(msg) = lore_bus::decode::<DocChunks>(TOPIC_DOC_CHUNKS, value) else {
                    continue;
                };
                let doc_id = msg.document_id;
                if let Err(e) = vectorizer.vectorizer.process(msg).await {
                    vectorizer.mark_failed(doc_id, &format!("vectorize failed: {}", e));
                }
            }
        });

        Ok(())
    }

    /// Stage A: extract text and hand off to the splitter.
    async fn handle_upload(&self, msg: DocUpload) -> Result<()> {
        let doc_id = msg.document_id;
        info!(document_id = doc_id, file = %msg.file_name, "parsing document");

        if !self.documents.exists(doc_id)? {
            warn!(document_id = doc_id, "document vanished before parsing, skipping");
            return Ok(());
        }
        self.documents
            .set_status(doc_id, DocumentStatus::Parsing, None)?;

        let path = self.storage.absolute(&msg.file_path);
        let budget = if msg.file_name.to_lowercase().ends_with(".pdf") {
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            parser::pdf_time_budget(parser::estimate_pdf_pages(size))
        } else {
            PARSE_BUDGET
        };

        let parse = tokio::task::spawn_blocking(move || parser::parse_file(&path));
        let content = match tokio::time::timeout(budget, parse).await {
            Ok(joined) => joined
                .map_err(|e| IngestError::Parse(format!("parse task aborted: {}", e)))??,
            Err(_) => return Err(IngestError::Timeout(budget.as_secs())),
        };

        if content.trim().is_empty() {
            return Err(IngestError::Parse("parsed content is empty".to_string()));
        }

        self.bus.publish(
            TOPIC_DOC_PARSED,
            &DocParsed {
                document_id: doc_id,
                content,
                knowledge_id: msg.knowledge_id,
                file_name: msg.file_name,
            },
        )?;
        Ok(())
    }

    /// Stage B: chunk with the owning knowledge base's policy.
    async fn handle_parsed(&self, msg: DocParsed) -> Result<()> {
        let doc_id = msg.document_id;
        info!(document_id = doc_id, chars = msg.content.chars().count(), "splitting document");

        if !self.documents.exists(doc_id)? {
            warn!(document_id = doc_id, "document vanished before splitting, skipping");
            return Ok(());
        }
        self.documents
            .set_status(doc_id, DocumentStatus::Splitting, None)?;

        let (chunk_size, chunk_overlap) = match self.knowledge.get(msg.knowledge_id) {
            Ok(kb) => (kb.chunk_size as usize, kb.chunk_overlap as usize),
            Err(_) => (self.default_chunk_size, self.default_chunk_overlap),
        };

        let splitter = TextSplitter::new(chunk_size, chunk_overlap);
        let chunks = splitter.split(&msg.content);
        if chunks.is_empty() {
            return Err(IngestError::EmptySplit);
        }
        info!(document_id = doc_id, chunks = chunks.len(), "document split");

        self.bus.publish(
            TOPIC_DOC_CHUNKS,
            &DocChunks {
                document_id: doc_id,
                chunks,
                knowledge_id: msg.knowledge_id,
                file_name: msg.file_name,
            },
        )?;
        Ok(())
    }

    fn mark_failed(&self, document_id: i64, message: &str) {
        error!(document_id, message, "pipeline stage failed");
        if let Err(e) =
            self.documents
                .set_status(document_id, DocumentStatus::Failed, Some(message))
        {
            error!(document_id, error = %e, "could not record document failure");
        }
    }
}
