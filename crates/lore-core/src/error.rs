use thiserror::Error;

/// Business-level error shared across the workspace. The gateway maps each
/// variant onto the HTTP envelope `{code, msg, detail?}`.
#[derive(Debug, Error)]
pub enum LoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Storage degraded: {0}")]
    Degraded(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LoreError {
    /// HTTP status the surface layer should answer with.
    pub fn status(&self) -> u16 {
        match self {
            LoreError::Config(_) => 500,
            LoreError::AuthFailed(_) => 401,
            LoreError::PermissionDenied(_) => 403,
            LoreError::NotFound { .. } => 404,
            LoreError::Precondition(_) => 400,
            LoreError::Validation(_) => 422,
            LoreError::RateLimited(_) => 429,
            LoreError::PayloadTooLarge { .. } => 413,
            LoreError::Upstream(_) => 500,
            LoreError::Degraded(_) => 503,
            LoreError::Serialization(_) => 500,
            LoreError::Io(_) => 500,
            LoreError::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoreError>;
