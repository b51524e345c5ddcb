use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("model not found at {path}")]
    ModelNotFound { path: String },

    #[error("model load failed: {reason}")]
    ModelLoadFailed { reason: String },

    #[error("tokenization failed: {reason}")]
    TokenizationFailed { reason: String },

    #[error("inference failed: {reason}")]
    InferenceFailed { reason: String },
}

impl From<candle_core::Error> for EmbedError {
    fn from(e: candle_core::Error) -> Self {
        EmbedError::InferenceFailed {
            reason: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EmbedError>;
