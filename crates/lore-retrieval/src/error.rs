use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Store(#[from] lore_store::StoreError),

    #[error(transparent)]
    Search(#[from] lore_search::SearchError),

    #[error(transparent)]
    Provider(#[from] lore_providers::ProviderError),

    #[error(transparent)]
    Embed(#[from] lore_embed::EmbedError),

    #[error(transparent)]
    Bus(#[from] lore_bus::BusError),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
