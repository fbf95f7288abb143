use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;
pub type ProgressResult<T> = Result<T, ProgressError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// A unique constraint rejected the write.
    #[error("duplicate key on {constraint}")]
    Duplicate { constraint: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),
}

impl StorageError {
    pub fn is_duplicate_on(&self, name: &str) -> bool {
        matches!(self, StorageError::Duplicate { constraint } if constraint == name)
    }
}

/// Errors surfaced by progress, grading and issuance operations.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// HTTP-facing errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing caller identity: {0}")]
    Unauthenticated(String),

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            ApiError::Progress(ProgressError::NotFound(_))
            | ApiError::Progress(ProgressError::Storage(StorageError::NotFound(_))) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Progress(ProgressError::Unauthorized(_)) => {
                (StatusCode::FORBIDDEN, "UNAUTHORIZED")
            }
            ApiError::Progress(ProgressError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Progress(ProgressError::Validation(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR")
            }
            ApiError::Progress(ProgressError::Storage(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}
