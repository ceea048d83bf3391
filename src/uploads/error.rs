use super::validate::ValidationError;
use crate::store::{StoreError, UploadStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session {0} already exists")]
    DuplicateSession(String),
    #[error("upload session {0} not found")]
    UnknownSession(String),
    #[error("chunk index {index} is out of range for {total} chunks")]
    InvalidIndex { index: u32, total: u32 },
    #[error("upload session {identifier} is {status}")]
    SessionClosed {
        identifier: String,
        status: UploadStatus,
    },
    #[error("upload incomplete: received {received} of {expected} chunks")]
    IncompleteUpload { received: u32, expected: u32 },
    #[error("chunk {index} is missing from storage")]
    MissingChunk { index: u32 },
    #[error("declared {declared} chunks but the session expects {expected}")]
    ChunkCountMismatch { declared: u32, expected: u32 },
    #[error("invalid upload request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}
