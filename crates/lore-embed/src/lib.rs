pub mod device;
pub mod embedder;
pub mod error;
pub mod reranker;

pub use embedder::LocalEmbedder;
pub use error::EmbedError;
pub use reranker::CrossEncoder;
