use serde::{Deserialize, Serialize};

/// One retrieved chunk, as persisted with assistant messages and returned
/// by the retrieval-test endpoints. `score` is always in [0, 1]; `source`
/// names the leg(s) that recalled it, plus a rerank suffix when applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub chunk_id: String,
    pub document_id: i64,
    pub filename: String,
    pub content: String,
    pub score: f64,
    pub source: String,
}

/// Intermediate per-leg hit before fusion.
#[derive(Debug, Clone)]
pub struct LegHit {
    pub chunk_id: String,
    pub document_id: i64,
    pub score: f64,
}
