use super::{ApiError, AppState};
use axum::{
    extract::{Query, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Default, Deserialize)]
struct KeyQuery {
    #[serde(rename = "api-key")]
    api_key: Option<String>,
}

/// The key presented by a request: header first, then the `api-key` query
/// parameter.
fn presented_key(headers: &HeaderMap, request: &Request) -> Option<String> {
    if let Some(key) = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(key.to_string());
    }
    Query::<KeyQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.api_key)
}

/// Rejects requests without the configured key. No key configured means
/// the check is off.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state
        .config
        .server
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
    else {
        return Ok(next.run(request).await);
    };
    match presented_key(request.headers(), &request) {
        Some(key) if key == expected => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized),
    }
}
