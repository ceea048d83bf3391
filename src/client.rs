//! `wpaudit push`: upload a local file to a running gateway in chunks.

use crate::analysis::split_by_budget;
use crate::gateway::auth::API_KEY_HEADER;
use anyhow::{bail, Context, Result};
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Where and under which name the file is uploaded.
#[derive(Debug, Clone)]
pub struct PushTarget {
    pub site_url: String,
    pub theme: String,
    pub file_path: String,
    pub file_type: String,
    pub chunk_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub file_identifier: String,
    pub scan_id: i64,
    pub chunks: usize,
    pub bytes: usize,
}

#[derive(Serialize)]
struct InitBody<'a> {
    file_path: &'a str,
    file_type: &'a str,
    file_size: usize,
    total_chunks: usize,
    file_identifier: &'a str,
    site_url: &'a str,
    theme: &'a str,
}

#[derive(Serialize)]
struct ChunkBody<'a> {
    file_identifier: &'a str,
    chunk_index: usize,
    total_chunks: usize,
    chunk_data: String,
    chunk_size: usize,
}

#[derive(Serialize)]
struct FinalizeBody<'a> {
    file_identifier: &'a str,
    total_chunks: usize,
    uploaded_chunks: usize,
}

#[derive(Serialize)]
struct AbortBody<'a> {
    file_identifier: &'a str,
    reason: &'a str,
}

pub struct UploadClient {
    client: Client,
    server: String,
    api_key: Option<String>,
}

impl UploadClient {
    pub fn new(server: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            server: server.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Value> {
        let mut request = self.client.post(format!("{}{path}", self.server)).json(body);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .with_context(|| format!("POST {path} returned a non-JSON body"))?;
        if !status.is_success() {
            let message = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            bail!("POST {path} returned {status}: {message}");
        }
        Ok(payload)
    }

    /// Split on line boundaries and drive init, chunks and finalize. The
    /// session is aborted if any step after init fails.
    pub async fn push(&self, bytes: &[u8], target: &PushTarget) -> Result<PushReport> {
        let mut pieces = split_by_budget(bytes, target.chunk_bytes.max(1), <[u8]>::len);
        if pieces.is_empty() {
            pieces.push(&[]);
        }
        let file_identifier = uuid::Uuid::new_v4().simple().to_string();
        let total_chunks = pieces.len();

        self.post(
            "/files/upload/init",
            &InitBody {
                file_path: &target.file_path,
                file_type: &target.file_type,
                file_size: bytes.len(),
                total_chunks,
                file_identifier: &file_identifier,
                site_url: &target.site_url,
                theme: &target.theme,
            },
        )
        .await?;
        info!(%file_identifier, total_chunks, bytes = bytes.len(), "Upload session started");

        match self.send_chunks(&file_identifier, &pieces).await {
            Ok(scan_id) => Ok(PushReport {
                file_identifier,
                scan_id,
                chunks: total_chunks,
                bytes: bytes.len(),
            }),
            Err(e) => {
                let reason = format!("{e:#}");
                let abort = AbortBody {
                    file_identifier: &file_identifier,
                    reason: &reason,
                };
                if let Err(abort_err) = self.post("/files/upload/abort", &abort).await {
                    warn!(%file_identifier, "Abort failed: {abort_err:#}");
                }
                Err(e)
            }
        }
    }

    async fn send_chunks(&self, file_identifier: &str, pieces: &[&[u8]]) -> Result<i64> {
        let engine = base64::engine::general_purpose::STANDARD;
        for (chunk_index, piece) in pieces.iter().enumerate() {
            let reply = self
                .post(
                    "/files/upload/chunk",
                    &ChunkBody {
                        file_identifier,
                        chunk_index,
                        total_chunks: pieces.len(),
                        chunk_data: engine.encode(piece),
                        chunk_size: piece.len(),
                    },
                )
                .await?;
            debug!(
                file_identifier,
                chunk = chunk_index,
                remaining = %reply["remaining_chunks"],
                "Chunk sent"
            );
        }
        let reply = self
            .post(
                "/files/upload/finalize",
                &FinalizeBody {
                    file_identifier,
                    total_chunks: pieces.len(),
                    uploaded_chunks: pieces.len(),
                },
            )
            .await?;
        reply["scan_id"]
            .as_i64()
            .context("finalize response has no scan_id")
    }
}
