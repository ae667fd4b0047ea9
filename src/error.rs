use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Request-shaped errors surfaced to callers of the pipeline API.
///
/// Per-item problems never show up here; they are recorded as
/// [`ItemFailure`] and reflected in the batch status instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PipelineError::NotFound { entity, id: id.to_string() }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "VALIDATION_ERROR",
            PipelineError::Authorization(_) => "AUTHORIZATION_ERROR",
            PipelineError::NotFound { .. } => "NOT_FOUND",
            PipelineError::Config(_) => "CONFIG_ERROR",
            PipelineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Internal(anyhow::anyhow!("blocking task failed: {e}"))
    }
}

impl From<r2d2::Error> for PipelineError {
    fn from(e: r2d2::Error) -> Self {
        PipelineError::Internal(e.into())
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Internal(e.into())
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PipelineError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            PipelineError::Authorization(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            PipelineError::NotFound { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            PipelineError::Config(msg) => {
                tracing::error!(error = %msg, "configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal error occurred".to_string())
            }
            PipelineError::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal error occurred".to_string())
            }
        };

        let body = json!({
            "error": message,
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Failure of a single image or face. Recorded durably and counted, never
/// propagated to the batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ItemFailure {
    #[error("image could not be decoded: {0}")]
    Decode(String),

    #[error("face detection failed: {0}")]
    Detection(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("index write failed after {attempts} attempts: {reason}")]
    IndexWrite { attempts: u32, reason: String },
}

impl ItemFailure {
    /// Reason code stored in the `failure_kind` / `failure` columns.
    pub fn kind(&self) -> &'static str {
        match self {
            ItemFailure::Decode(_) => "decode_failure",
            ItemFailure::Detection(_) => "detection_failure",
            ItemFailure::Embedding(_) => "embedding_failure",
            ItemFailure::IndexWrite { .. } => "index_write_failure",
        }
    }
}
