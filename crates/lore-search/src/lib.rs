pub mod error;
pub mod keyword;
pub mod vector;

pub use error::SearchError;
pub use keyword::{KeywordHit, TextIndex};
pub use vector::{VectorHit, VectorStore};

use serde::{Deserialize, Serialize};

/// One chunk as written to both stores. `chunk_id = "{document_id}_{index}"`
/// and must stay consistent between the vector store and the inverted index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document_id: i64,
    pub knowledge_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub file_name: String,
    #[serde(default)]
    pub vector: Vec<f32>,
}

impl ChunkRecord {
    pub fn make_chunk_id(document_id: i64, index: usize) -> String {
        format!("{}_{}", document_id, index)
    }
}
