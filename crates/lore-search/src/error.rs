use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("vector store {op} failed for {collection}: {message}")]
    Vector {
        op: &'static str,
        collection: String,
        message: String,
    },

    #[error("inverted index {op} failed: {message}")]
    Index { op: &'static str, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, SearchError>;
