use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub uploads: UploadsConfig,
    pub analyzer: AnalyzerConfig,
    pub analysis: AnalysisConfig,
    pub queue: QueueConfig,
    pub scan: ScanConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Shared key compared against `X-Api-Key` / `api-key`. Unset disables the check.
    pub api_key: Option<String>,
    /// Request body limit in bytes; chunk and direct uploads arrive base64 encoded.
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8089".into(),
            api_key: None,
            max_body_bytes: 64 * 1024 * 1024,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for stored files, chunk bytes and suggestion bundles. `~` is expanded.
    pub base_dir: String,
    /// SQLite file; relative paths resolve against `base_dir`.
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: "~/.wpaudit/storage".into(),
            database: "wpaudit.db".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct UploadsConfig {
    /// Sessions older than this are replaced on init and purged by cleanup.
    pub session_ttl_secs: u64,
    pub max_total_chunks: u32,
    /// Default chunk size used by `wpaudit push`.
    pub client_chunk_bytes: usize,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 24 * 60 * 60,
            max_total_chunks: 10_000,
            client_chunk_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub chunk_timeout_secs: u64,
    pub summary_timeout_secs: u64,
    pub summary_max_tokens: u32,
    pub max_attempts: u32,
    /// Fixed delay between attempts; rate-limited attempts back off exponentially from it.
    pub retry_base_delay_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            temperature: 0.1,
            max_tokens: 2500,
            chunk_timeout_secs: 180,
            summary_timeout_secs: 90,
            summary_max_tokens: 300,
            max_attempts: 3,
            retry_base_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AnalysisConfig {
    pub chunk_policy: ChunkPolicy,
    pub lines_per_chunk: usize,
    /// Budget for the token policy, estimated at four bytes per token.
    pub max_tokens_per_chunk: usize,
    pub max_concurrent_chunks: usize,
    /// Skip the documentation summary call entirely.
    pub skip_summary: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            chunk_policy: ChunkPolicy::Lines,
            lines_per_chunk: 100,
            max_tokens_per_chunk: 4000,
            max_concurrent_chunks: 4,
            skip_summary: false,
        }
    }
}

/// How a file is cut into analysis chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChunkPolicy {
    /// Fixed runs of `lines_per_chunk` lines.
    Lines,
    /// Whole lines accumulated up to `max_tokens_per_chunk`.
    Tokens,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_secs: u64,
    pub auto_enqueue: bool,
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            backoff_secs: 60,
            auto_enqueue: true,
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ScanConfig {
    pub retention_days: u32,
    pub archive_instead_of_delete: bool,
    pub stuck_after_hours: u32,
    pub stuck_limit: usize,
    /// Most scans removed or archived by one cleanup run.
    pub cleanup_limit: usize,
    /// Most `pending` scans queued by one `process-pending` run.
    pub pending_limit: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            archive_instead_of_delete: false,
            stuck_after_hours: 1,
            stuck_limit: 5,
            cleanup_limit: 1000,
            pending_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}
