//! `/files/*` handlers: direct and chunked uploads, and scan status.

use super::{ApiError, ApiJson, ApiResult, AppState};
use crate::store::{now_timestamp, FileScan, NewUpload};
use crate::uploads::{DirectUpload, UploadError};
use axum::{
    extract::{Path, State},
    Json,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct DirectUploadRequest {
    pub file_path: String,
    pub file_type: String,
    /// Base64 file bytes.
    pub content: String,
    pub site_url: String,
    #[serde(default)]
    pub theme: String,
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub file_path: String,
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub file_identifier: String,
    pub site_url: String,
    #[serde(default)]
    pub theme: String,
}

#[derive(Debug, Deserialize)]
pub struct ChunkRequest {
    pub file_identifier: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Base64 chunk bytes.
    pub chunk_data: String,
    /// Informational; the decoded length is what gets recorded.
    pub chunk_size: u64,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub file_identifier: String,
    pub total_chunks: Option<u32>,
    pub uploaded_chunks: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    pub file_identifier: String,
    pub reason: Option<String>,
}

/// Decode standard base64, tolerating a browser `data:...;base64,` prefix.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match data.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, body)| body),
        None => data,
    };
    base64::engine::general_purpose::STANDARD.decode(payload.trim())
}

fn require(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::Validation(format!("The {field} field is required.")));
    }
    Ok(())
}

/// Queue a freshly stored scan when auto-enqueue is on. Failure to queue
/// leaves the scan `pending`; the upload itself still succeeded.
async fn auto_enqueue(state: &AppState, scan: &FileScan) -> bool {
    if !state.config.queue.auto_enqueue {
        return false;
    }
    match state.queue.enqueue(scan.id).await {
        Ok(_) => true,
        Err(e) => {
            warn!(scan_id = scan.id, "Scan not queued: {e}");
            false
        }
    }
}

pub async fn direct_upload(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<DirectUploadRequest>,
) -> ApiResult<Json<Value>> {
    require("file_path", &req.file_path)?;
    require("file_type", &req.file_type)?;
    require("site_url", &req.site_url)?;
    let content = decode_base64(&req.content)
        .map_err(|e| ApiError::Validation(format!("content is not valid base64: {e}")))?;

    let scan = state
        .assembler
        .direct_upload(DirectUpload {
            site_url: req.site_url,
            theme: req.theme,
            file_path: req.file_path,
            file_type: req.file_type,
            content,
        })
        .await?;
    let queued = auto_enqueue(&state, &scan).await;
    Ok(Json(json!({
        "success": true,
        "message": "File processed successfully",
        "scan_id": scan.id,
        "queued": queued,
        "timestamp": now_timestamp(),
    })))
}

pub async fn init(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<InitRequest>,
) -> ApiResult<Json<Value>> {
    require("file_identifier", &req.file_identifier)?;
    require("file_path", &req.file_path)?;
    require("file_type", &req.file_type)?;
    require("site_url", &req.site_url)?;
    let max = state.config.uploads.max_total_chunks;
    if req.total_chunks > max {
        return Err(ApiError::BadRequest(format!(
            "total_chunks {} exceeds the limit of {max}",
            req.total_chunks
        )));
    }

    let upload = state
        .assembler
        .chunks()
        .init_session(NewUpload {
            file_identifier: req.file_identifier,
            site_url: req.site_url,
            theme: req.theme,
            file_path: req.file_path,
            file_type: req.file_type,
            file_size: req.file_size,
            total_chunks: req.total_chunks,
        })
        .await?;
    state
        .metrics
        .uploads_received
        .with_label_values(&["chunked"])
        .inc();
    Ok(Json(json!({
        "success": true,
        "message": "Chunk upload initialized",
        "upload_id": upload.id,
        "file_identifier": upload.file_identifier,
    })))
}

pub async fn chunk(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ChunkRequest>,
) -> ApiResult<Json<Value>> {
    require("file_identifier", &req.file_identifier)?;
    let bytes = decode_base64(&req.chunk_data)
        .map_err(|e| ApiError::BadRequest(format!("chunk_data is not valid base64: {e}")))?;
    if bytes.len() as u64 != req.chunk_size {
        warn!(
            file_identifier = %req.file_identifier,
            chunk = req.chunk_index,
            declared = req.chunk_size,
            decoded = bytes.len(),
            "Chunk size differs from declared size"
        );
    }

    let chunks = state.assembler.chunks();
    if let Some(session) = chunks.get(&req.file_identifier)? {
        if session.total_chunks != req.total_chunks {
            return Err(UploadError::ChunkCountMismatch {
                declared: req.total_chunks,
                expected: session.total_chunks,
            }
            .into());
        }
    }
    let upload = chunks
        .put_chunk(&req.file_identifier, req.chunk_index, &bytes)
        .await?;
    state.metrics.chunks_received.inc();
    Ok(Json(json!({
        "success": true,
        "message": "Chunk received successfully",
        "chunk_index": req.chunk_index,
        "received_chunks": upload.received_chunks,
        "remaining_chunks": upload.remaining_chunks(),
    })))
}

pub async fn finalize(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<FinalizeRequest>,
) -> ApiResult<Json<Value>> {
    require("file_identifier", &req.file_identifier)?;
    if let (Some(total), Some(uploaded)) = (req.total_chunks, req.uploaded_chunks) {
        if total != uploaded {
            info!(
                file_identifier = %req.file_identifier,
                total,
                uploaded,
                "Client reports a partial upload at finalize"
            );
        }
    }
    let scan = state
        .assembler
        .finalize(&req.file_identifier, req.total_chunks)
        .await?;
    let queued = auto_enqueue(&state, &scan).await;
    Ok(Json(json!({
        "success": true,
        "message": "File upload complete",
        "scan_id": scan.id,
        "file_path": scan.file_path,
        "queued": queued,
        "timestamp": now_timestamp(),
    })))
}

pub async fn abort(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<AbortRequest>,
) -> ApiResult<Json<Value>> {
    require("file_identifier", &req.file_identifier)?;
    state
        .assembler
        .abort(&req.file_identifier, req.reason.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Upload aborted successfully",
    })))
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let scan = state
        .recorder
        .index()
        .get_scan(id)?
        .ok_or_else(|| ApiError::NotFound(format!("File scan {id} not found")))?;
    Ok(Json(json!({
        "scan_id": scan.id,
        "status": scan.status,
        "message": scan.status.message(),
        "file_path": scan.file_path,
        "processed_at": scan.processed_at,
        "issues_found": scan.issues_found,
    })))
}
