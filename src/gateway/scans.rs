//! `/scans/*` handlers plus health and metrics.

use super::{ApiError, ApiJson, ApiResult, AppState};
use crate::scan::QueueError;
use crate::store::{ScanStatus, SuggestionStatus};
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

/// Manual retries allowed per scan through `/scans/retry`.
pub const MAX_MANUAL_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub scan_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub scan_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub scan_id: Option<i64>,
    #[serde(default)]
    pub scan_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub site_url: String,
}

/// Queue one scan, answering with its resulting state. Scans already owned
/// by a worker or already completed are reported, not re-queued.
async fn queue_one(state: &AppState, scan_id: i64) -> ApiResult<Value> {
    let scan = state
        .recorder
        .index()
        .get_scan(scan_id)?
        .ok_or(QueueError::NotFound(scan_id))?;
    let reported = match scan.status {
        ScanStatus::Completed | ScanStatus::Archived => Some("already_processed"),
        ScanStatus::Queued => Some("queued"),
        ScanStatus::Processing => Some("processing"),
        ScanStatus::Pending | ScanStatus::Failed => None,
    };
    if let Some(status) = reported {
        return Ok(json!({
            "scan_id": scan_id,
            "status": status,
            "message": scan.status.message(),
        }));
    }
    state.queue.enqueue(scan_id).await?;
    Ok(json!({
        "scan_id": scan_id,
        "status": "queued",
        "message": "File scan has been queued for processing",
    }))
}

/// Split per-scan outcomes into `results` and `errors`.
fn split(outcomes: Vec<(i64, ApiResult<Value>)>) -> Json<Value> {
    let mut results = Vec::new();
    let mut errors = Vec::new();
    for (scan_id, outcome) in outcomes {
        match outcome {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(scan_id, "Batch entry failed: {e}");
                errors.push(json!({"scan_id": scan_id, "error": e.to_string()}));
            }
        }
    }
    let status = if errors.is_empty() { "success" } else { "partial" };
    Json(json!({
        "success": errors.is_empty(),
        "status": status,
        "results": results,
        "errors": errors,
    }))
}

pub async fn process(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ProcessRequest>,
) -> ApiResult<Json<Value>> {
    let mut result = queue_one(&state, req.scan_id).await?;
    result["success"] = json!(true);
    Ok(Json(result))
}

pub async fn batch(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<BatchRequest>,
) -> ApiResult<Json<Value>> {
    if req.scan_ids.is_empty() {
        return Err(ApiError::Validation("The scan_ids field is required.".into()));
    }
    let mut outcomes = Vec::with_capacity(req.scan_ids.len());
    for scan_id in req.scan_ids {
        outcomes.push((scan_id, queue_one(&state, scan_id).await));
    }
    Ok(split(outcomes))
}

async fn retry_one(state: &AppState, scan_id: i64) -> ApiResult<Value> {
    let recorder = &state.recorder;
    let scan = recorder
        .index()
        .get_scan(scan_id)?
        .ok_or(QueueError::NotFound(scan_id))?;
    if scan.status != ScanStatus::Failed {
        return Ok(json!({
            "scan_id": scan_id,
            "status": "skipped",
            "message": "No failed suggestions to retry",
        }));
    }
    let retries = recorder
        .index()
        .suggestion_for_scan(scan_id)?
        .filter(|s| s.status == SuggestionStatus::Failed || s.status == SuggestionStatus::Pending)
        .map_or(0, |s| s.retry_count);
    if retries >= MAX_MANUAL_RETRIES {
        return Err(ApiError::Conflict(format!(
            "scan {scan_id} has used all {MAX_MANUAL_RETRIES} retries"
        )));
    }
    let retry_count = recorder.bump_retry(&scan)?;
    state.queue.enqueue(scan_id).await?;
    Ok(json!({
        "scan_id": scan_id,
        "status": "queued",
        "retry_count": retry_count,
    }))
}

pub async fn retry(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RetryRequest>,
) -> ApiResult<Json<Value>> {
    let mut ids = req.scan_ids;
    if let Some(id) = req.scan_id {
        ids.insert(0, id);
    }
    ids.dedup();
    if ids.is_empty() {
        return Err(ApiError::Validation(
            "Either scan_id or scan_ids is required.".into(),
        ));
    }
    let mut outcomes = Vec::with_capacity(ids.len());
    for scan_id in ids {
        outcomes.push((scan_id, retry_one(&state, scan_id).await));
    }
    Ok(split(outcomes))
}

pub async fn suggestions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let index = state.recorder.index();
    let scan = index
        .get_scan(id)?
        .ok_or_else(|| ApiError::NotFound(format!("File scan {id} not found")))?;
    let suggestion = index.suggestion_for_scan(id)?;
    let bundle_path = suggestion
        .as_ref()
        .and_then(|s| s.metadata.get("suggestion_file_path"))
        .and_then(Value::as_str);
    let bundle = match bundle_path {
        Some(path) => match state.recorder.storage().read(path).await {
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes).ok(),
            Err(e) => {
                warn!(scan_id = id, path, "Suggestion bundle unreadable: {e:#}");
                None
            }
        },
        None => None,
    };
    Ok(Json(json!({
        "status": "success",
        "scan": scan,
        "suggestions": suggestion.into_iter().collect::<Vec<_>>(),
        "bundle": bundle,
    })))
}

pub async fn latest(
    State(state): State<AppState>,
    Query(query): Query<LatestQuery>,
) -> ApiResult<Json<Value>> {
    if query.site_url.trim().is_empty() {
        return Err(ApiError::Validation("The site_url field is required.".into()));
    }
    let scans = state.recorder.index().latest_scans_for_site(&query.site_url)?;
    Ok(Json(json!({
        "site_url": query.site_url,
        "count": scans.len(),
        "scans": scans,
    })))
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let index = state.recorder.index();
    let scan = index
        .get_scan(id)?
        .ok_or_else(|| ApiError::NotFound(format!("File scan {id} not found")))?;
    let counts = index.suggestion_counts(id)?;
    Ok(Json(json!({
        "scan_id": scan.id,
        "file_path": scan.file_path,
        "status": scan.status,
        "message": scan.status.message(),
        "processed_at": scan.processed_at,
        "issues_found": scan.issues_found,
        "suggestion_counts": counts,
    })))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, state.metrics.content_type())], body).into_response())
}
