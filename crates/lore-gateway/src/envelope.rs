use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

/// Error envelope every non-2xx response carries: `{code, msg, detail?}`.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub code: u16,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub msg: String,
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
            detail: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, msg = %self.msg, "request failed");
        }
        let body = Envelope {
            code: self.status.as_u16(),
            msg: self.msg,
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<lore_core::LoreError> for ApiError {
    fn from(err: lore_core::LoreError) -> Self {
        let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.to_string())
    }
}

impl From<lore_store::StoreError> for ApiError {
    fn from(err: lore_store::StoreError) -> Self {
        lore_core::LoreError::from(err).into()
    }
}

impl From<lore_search::SearchError> for ApiError {
    fn from(err: lore_search::SearchError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<lore_retrieval::RetrievalError> for ApiError {
    fn from(err: lore_retrieval::RetrievalError) -> Self {
        match err {
            lore_retrieval::RetrievalError::Store(e) => e.into(),
            lore_retrieval::RetrievalError::Validation(m) => Self::validation(m),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<lore_ingest::IngestError> for ApiError {
    fn from(err: lore_ingest::IngestError) -> Self {
        match err {
            lore_ingest::IngestError::Store(e) => e.into(),
            lore_ingest::IngestError::UnsupportedFormat(ext) => {
                Self::bad_request(format!("unsupported file format: {}", ext))
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<lore_providers::ProviderError> for ApiError {
    fn from(err: lore_providers::ProviderError) -> Self {
        Self::internal(format!("upstream provider error: {}", err))
    }
}

impl From<lore_bus::BusError> for ApiError {
    fn from(err: lore_bus::BusError) -> Self {
        Self::internal(err.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
