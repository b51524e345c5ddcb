use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("parse timed out after {0}s")]
    Timeout(u64),

    #[error("split produced no chunks")]
    EmptySplit,

    #[error(transparent)]
    Store(#[from] lore_store::StoreError),

    #[error(transparent)]
    Search(#[from] lore_search::SearchError),

    #[error(transparent)]
    Bus(#[from] lore_bus::BusError),

    #[error(transparent)]
    Provider(#[from] lore_providers::ProviderError),

    #[error(transparent)]
    Embed(#[from] lore_embed::EmbedError),
}

pub type Result<T> = std::result::Result<T, IngestError>;
