use super::status::{ScanStatus, SuggestionStatus, UploadStatus};
use serde::{Deserialize, Serialize};

/// One observation of a (site_url, file_path, file_type) file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileScan {
    pub id: i64,
    pub site_url: String,
    pub theme: String,
    pub file_path: String,
    pub file_type: String,
    /// Path of the stored bytes, relative to the storage root.
    pub storage_path: Option<String>,
    /// SHA-256 hex of the whole file; the change-detection fingerprint.
    pub content_hash: Option<String>,
    pub byte_len: Option<u64>,
    pub scan_date: String,
    pub status: ScanStatus,
    pub issues_found: Option<u64>,
    pub processed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields supplied when a scan is first recorded.
#[derive(Debug, Clone, Default)]
pub struct NewScan {
    pub site_url: String,
    pub theme: String,
    pub file_path: String,
    pub file_type: String,
    pub storage_path: Option<String>,
    pub content_hash: Option<String>,
    pub byte_len: Option<u64>,
}

/// The consolidated analysis result for a scan. One row per scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSuggestion {
    pub id: i64,
    pub file_scan_id: i64,
    pub file_path: String,
    /// Serialized suggestion bundle (issues + documentation).
    pub suggestion: String,
    pub status: SuggestionStatus,
    pub ai_model: Option<String>,
    pub token_count: Option<u64>,
    pub retry_count: u32,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Values written by the suggestion upsert.
#[derive(Debug, Clone)]
pub struct SuggestionWrite {
    pub file_scan_id: i64,
    pub file_path: String,
    pub suggestion: String,
    pub status: SuggestionStatus,
    pub ai_model: Option<String>,
    pub token_count: Option<u64>,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
}

/// Persisted state of a chunked upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpload {
    pub id: i64,
    pub file_identifier: String,
    pub site_url: String,
    pub theme: String,
    pub file_path: String,
    pub file_type: String,
    pub file_size: u64,
    pub status: UploadStatus,
    pub total_chunks: u32,
    pub received_chunks: u32,
    /// Received flag per chunk index; length always equals `total_chunks`.
    pub chunk_status: Vec<bool>,
    pub started_at: String,
    pub failure_reason: Option<String>,
}

impl FileUpload {
    pub fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks
    }

    pub fn remaining_chunks(&self) -> u32 {
        self.total_chunks.saturating_sub(self.received_chunks)
    }
}

/// Per-chunk bookkeeping row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUploadChunk {
    pub upload_id: i64,
    pub chunk_index: u32,
    pub chunk_size: u64,
    pub chunk_path: String,
    pub is_received: bool,
    pub received_at: Option<String>,
}

/// A scan paired with its suggestion, for the per-site listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanWithSuggestion {
    #[serde(flatten)]
    pub scan: FileScan,
    pub suggestion: Option<FileSuggestion>,
}
