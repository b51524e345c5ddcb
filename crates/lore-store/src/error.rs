use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for lore_core::LoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => lore_core::LoreError::NotFound { entity, id },
            StoreError::Forbidden(m) => lore_core::LoreError::PermissionDenied(m),
            StoreError::Precondition(m) => lore_core::LoreError::Precondition(m),
            StoreError::Validation(m) => lore_core::LoreError::Validation(m),
            StoreError::Crypto(m) => lore_core::LoreError::Internal(m),
            StoreError::Database(e) => lore_core::LoreError::Internal(e.to_string()),
            StoreError::Serialization(e) => lore_core::LoreError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
