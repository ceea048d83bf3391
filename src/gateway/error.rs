use crate::scan::QueueError;
use crate::store::StoreError;
use crate::uploads::UploadError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the HTTP handlers. Every variant renders as a JSON
/// body with an `error` key.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("missing or invalid API key")]
    Unauthorized,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Upload(err) => match err {
                UploadError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                UploadError::UnknownSession(_) => StatusCode::NOT_FOUND,
                UploadError::IncompleteUpload { .. }
                | UploadError::InvalidIndex { .. }
                | UploadError::MissingChunk { .. }
                | UploadError::ChunkCountMismatch { .. }
                | UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                UploadError::DuplicateSession(_) | UploadError::SessionClosed { .. } => {
                    StatusCode::CONFLICT
                }
                UploadError::Store(StoreError::Transition(_)) => StatusCode::CONFLICT,
                UploadError::Store(_) | UploadError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Queue(err) => match err {
                QueueError::NotFound(_) => StatusCode::NOT_FOUND,
                QueueError::NotEligible { .. } => StatusCode::CONFLICT,
                QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
                QueueError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Store(err) => match err {
                StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                StoreError::Transition(_) | StoreError::Conflict(_) => StatusCode::CONFLICT,
                StoreError::Database(_) | StoreError::Json(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self.status().as_u16() {
            422 => "validation",
            400 => "bad_request",
            401 => "unauthorized",
            404 => "not_found",
            409 => "conflict",
            503 => "unavailable",
            _ => "internal",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), "Request failed: {self}");
        }
        let mut payload = json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let ApiError::Upload(UploadError::IncompleteUpload { received, expected }) = &self {
            payload["received"] = json!(received);
            payload["expected"] = json!(expected);
        }
        (status, Json(payload)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
