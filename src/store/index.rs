use super::schema::{FileScan, FileSuggestion, NewScan, ScanWithSuggestion, SuggestionWrite};
use super::status::{ScanStatus, SuggestionStatus, TransitionError};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt column: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Row mappers return a nested result so decoding errors keep their type.
pub(super) fn flatten<T>(row: rusqlite::Result<StoreResult<T>>) -> StoreResult<T> {
    row?
}

/// UTC timestamp with fixed precision so string order equals time order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Timestamp `age` before now, in the same format as [`now_timestamp`].
pub fn timestamp_ago(age: std::time::Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

const SCAN_COLUMNS: &str = "id, site_url, theme, file_path, file_type, storage_path, content_hash,
     byte_len, scan_date, status, issues_found, processed_at, created_at, updated_at";

const SUGGESTION_COLUMNS: &str = "id, file_scan_id, file_path, suggestion, status, ai_model,
     token_count, retry_count, metadata, error, created_at, updated_at";

/// SQLite-backed index of scans, suggestions and upload sessions.
pub struct ScanIndex {
    pub(super) conn: Arc<Mutex<Connection>>,
}

impl ScanIndex {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store   = MEMORY;",
        )?;
        Self::init_schema(&conn).context("Failed to init scan schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS file_scans (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                site_url      TEXT NOT NULL,
                theme         TEXT NOT NULL,
                file_path     TEXT NOT NULL,
                file_type     TEXT NOT NULL,
                storage_path  TEXT,
                content_hash  TEXT,
                byte_len      INTEGER,
                scan_date     TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                issues_found  INTEGER,
                processed_at  TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scans_site ON file_scans(site_url);
            CREATE INDEX IF NOT EXISTS idx_scans_path ON file_scans(file_path, status);
            CREATE INDEX IF NOT EXISTS idx_scans_status ON file_scans(status, updated_at);

            CREATE TABLE IF NOT EXISTS file_suggestions (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                file_scan_id  INTEGER NOT NULL UNIQUE
                              REFERENCES file_scans(id) ON DELETE CASCADE,
                file_path     TEXT NOT NULL,
                suggestion    TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                ai_model      TEXT,
                token_count   INTEGER,
                retry_count   INTEGER NOT NULL DEFAULT 0,
                metadata      TEXT NOT NULL DEFAULT '{}',
                error         TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_suggestions_status ON file_suggestions(file_scan_id, status);

            CREATE TABLE IF NOT EXISTS file_uploads (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                file_identifier  TEXT NOT NULL UNIQUE,
                site_url         TEXT NOT NULL,
                theme            TEXT NOT NULL,
                file_path        TEXT NOT NULL,
                file_type        TEXT NOT NULL,
                file_size        INTEGER NOT NULL,
                status           TEXT NOT NULL DEFAULT 'pending',
                total_chunks     INTEGER NOT NULL,
                received_chunks  INTEGER NOT NULL DEFAULT 0,
                chunk_status     TEXT NOT NULL,
                started_at       TEXT NOT NULL,
                failure_reason   TEXT
            );

            CREATE TABLE IF NOT EXISTS file_upload_chunks (
                upload_id    INTEGER NOT NULL REFERENCES file_uploads(id) ON DELETE CASCADE,
                chunk_index  INTEGER NOT NULL,
                chunk_size   INTEGER NOT NULL,
                chunk_path   TEXT NOT NULL,
                is_received  INTEGER NOT NULL DEFAULT 0,
                received_at  TEXT,
                PRIMARY KEY (upload_id, chunk_index)
            );",
        )
    }

    // ── scans ────────────────────────────────────────────────────

    /// Insert a new scan in the given initial status.
    pub fn insert_scan(&self, scan: &NewScan, status: ScanStatus) -> StoreResult<FileScan> {
        let conn = self.conn.lock();
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO file_scans (site_url, theme, file_path, file_type, storage_path,
             content_hash, byte_len, scan_date, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?8, ?8)",
            params![
                scan.site_url,
                scan.theme,
                scan.file_path,
                scan.file_type,
                scan.storage_path,
                scan.content_hash,
                scan.byte_len.map(|n| n as i64),
                now,
                status.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::fetch_scan(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("scan {id}")))
    }

    pub fn get_scan(&self, id: i64) -> StoreResult<Option<FileScan>> {
        let conn = self.conn.lock();
        Self::fetch_scan(&conn, id)
    }

    fn fetch_scan(conn: &Connection, id: i64) -> StoreResult<Option<FileScan>> {
        let sql = format!("SELECT {SCAN_COLUMNS} FROM file_scans WHERE id = ?1");
        let row = conn
            .query_row(&sql, params![id], Self::row_to_scan)
            .optional()?;
        row.transpose()
    }

    /// Move a scan to `to`, validated against the scan transition table.
    pub fn transition_scan(&self, id: i64, to: ScanStatus) -> StoreResult<FileScan> {
        let conn = self.conn.lock();
        let current = Self::fetch_scan(&conn, id)?
            .ok_or_else(|| StoreError::NotFound(format!("scan {id}")))?;
        current.status.transition(to)?;
        let now = now_timestamp();
        let processed_at = matches!(to, ScanStatus::Completed | ScanStatus::Failed).then(|| now.clone());
        conn.execute(
            "UPDATE file_scans SET status = ?1, updated_at = ?2,
             processed_at = COALESCE(?3, processed_at) WHERE id = ?4",
            params![to.as_str(), now, processed_at, id],
        )?;
        Self::fetch_scan(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("scan {id}")))
    }

    /// Final step of a successful analysis.
    pub fn complete_scan(&self, id: i64, issues_found: u64) -> StoreResult<FileScan> {
        let conn = self.conn.lock();
        let current = Self::fetch_scan(&conn, id)?
            .ok_or_else(|| StoreError::NotFound(format!("scan {id}")))?;
        current.status.transition(ScanStatus::Completed)?;
        let now = now_timestamp();
        conn.execute(
            "UPDATE file_scans SET status = 'completed', issues_found = ?1,
             processed_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![issues_found as i64, now, id],
        )?;
        Self::fetch_scan(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("scan {id}")))
    }

    pub fn set_fingerprint(&self, id: i64, content_hash: &str, byte_len: u64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE file_scans SET content_hash = ?1, byte_len = ?2, updated_at = ?3 WHERE id = ?4",
            params![content_hash, byte_len as i64, now_timestamp(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("scan {id}")));
        }
        Ok(())
    }

    /// Most recent completed scan for a file; the authority for change detection.
    pub fn latest_completed(&self, site_url: &str, file_path: &str) -> StoreResult<Option<FileScan>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM file_scans
             WHERE site_url = ?1 AND file_path = ?2 AND status = 'completed'
             ORDER BY scan_date DESC, id DESC LIMIT 1"
        );
        let row = conn
            .query_row(&sql, params![site_url, file_path], Self::row_to_scan)
            .optional()?;
        row.transpose()
    }

    pub fn scans_with_status(&self, status: ScanStatus, limit: usize) -> StoreResult<Vec<FileScan>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM file_scans WHERE status = ?1 ORDER BY id LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], Self::row_to_scan)?;
        rows.map(flatten).collect()
    }

    /// Scans stuck in `processing` whose last update is older than `before`.
    pub fn stuck_scans(&self, before: &str, limit: usize) -> StoreResult<Vec<FileScan>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM file_scans
             WHERE status = 'processing' AND updated_at < ?1
             ORDER BY updated_at LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![before, limit as i64], Self::row_to_scan)?;
        rows.map(flatten).collect()
    }

    /// Scans last processed (or, never processed, created) before `before`,
    /// oldest first.
    pub fn scans_older_than(
        &self,
        before: &str,
        include_archived: bool,
        limit: usize,
    ) -> StoreResult<Vec<FileScan>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM file_scans
             WHERE COALESCE(processed_at, created_at) < ?1 AND (?2 OR status != 'archived')
             ORDER BY id LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![before, include_archived, limit as i64],
            Self::row_to_scan,
        )?;
        rows.map(flatten).collect()
    }

    /// How many scans other than `id` point at the stored file `storage_path`.
    pub fn storage_path_refs(&self, storage_path: &str, id: i64) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM file_scans WHERE storage_path = ?1 AND id != ?2",
            params![storage_path, id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Latest scan per file path for a site, newest first, each with its suggestion.
    pub fn latest_scans_for_site(&self, site_url: &str) -> StoreResult<Vec<ScanWithSuggestion>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM file_scans
             WHERE id IN (SELECT MAX(id) FROM file_scans WHERE site_url = ?1 GROUP BY file_path)
             ORDER BY scan_date DESC, id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let scans: Vec<FileScan> = stmt
            .query_map(params![site_url], Self::row_to_scan)?
            .map(flatten)
            .collect::<StoreResult<_>>()?;
        drop(stmt);

        scans
            .into_iter()
            .map(|scan| {
                let suggestion = Self::fetch_suggestion(&conn, scan.id)?;
                Ok(ScanWithSuggestion { scan, suggestion })
            })
            .collect()
    }

    /// Delete a scan; its suggestion goes with it.
    pub fn delete_scan(&self, id: i64) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM file_scans WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // ── suggestions ──────────────────────────────────────────────

    /// Create or overwrite the suggestion for a scan.
    pub fn upsert_suggestion(&self, write: &SuggestionWrite) -> StoreResult<FileSuggestion> {
        let conn = self.conn.lock();
        if let Some(existing) = Self::fetch_suggestion(&conn, write.file_scan_id)? {
            if existing.status != write.status {
                existing.status.transition(write.status)?;
            }
        }
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO file_suggestions (file_scan_id, file_path, suggestion, status, ai_model,
             token_count, metadata, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(file_scan_id) DO UPDATE SET
                file_path = excluded.file_path,
                suggestion = excluded.suggestion,
                status = excluded.status,
                ai_model = excluded.ai_model,
                token_count = excluded.token_count,
                metadata = excluded.metadata,
                error = excluded.error,
                updated_at = excluded.updated_at",
            params![
                write.file_scan_id,
                write.file_path,
                write.suggestion,
                write.status.as_str(),
                write.ai_model,
                write.token_count.map(|n| n as i64),
                serde_json::to_string(&write.metadata)?,
                write.error,
                now,
            ],
        )?;
        Self::fetch_suggestion(&conn, write.file_scan_id)?
            .ok_or_else(|| StoreError::NotFound(format!("suggestion for scan {}", write.file_scan_id)))
    }

    pub fn suggestion_for_scan(&self, scan_id: i64) -> StoreResult<Option<FileSuggestion>> {
        let conn = self.conn.lock();
        Self::fetch_suggestion(&conn, scan_id)
    }

    fn fetch_suggestion(conn: &Connection, scan_id: i64) -> StoreResult<Option<FileSuggestion>> {
        let sql = format!("SELECT {SUGGESTION_COLUMNS} FROM file_suggestions WHERE file_scan_id = ?1");
        let row = conn
            .query_row(&sql, params![scan_id], Self::row_to_suggestion)
            .optional()?;
        row.transpose()
    }

    /// Count of suggestions per status for a scan.
    pub fn suggestion_counts(&self, scan_id: i64) -> StoreResult<BTreeMap<String, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM file_suggestions WHERE file_scan_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![scan_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Bump the retry counter of a scan's suggestion and return the new value.
    pub fn increment_suggestion_retry(&self, scan_id: i64) -> StoreResult<u32> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE file_suggestions SET retry_count = retry_count + 1, updated_at = ?1
             WHERE file_scan_id = ?2",
            params![now_timestamp(), scan_id],
        )?;
        conn.query_row(
            "SELECT retry_count FROM file_suggestions WHERE file_scan_id = ?1",
            params![scan_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .map(|n| n as u32)
        .ok_or_else(|| StoreError::NotFound(format!("suggestion for scan {scan_id}")))
    }

    // ── row mapping ──────────────────────────────────────────────

    fn row_to_scan(row: &Row) -> rusqlite::Result<StoreResult<FileScan>> {
        let status: String = row.get(9)?;
        let status = match status.parse::<ScanStatus>() {
            Ok(s) => s,
            Err(e) => return Ok(Err(e.into())),
        };
        Ok(Ok(FileScan {
            id: row.get(0)?,
            site_url: row.get(1)?,
            theme: row.get(2)?,
            file_path: row.get(3)?,
            file_type: row.get(4)?,
            storage_path: row.get(5)?,
            content_hash: row.get(6)?,
            byte_len: row.get::<_, Option<i64>>(7)?.map(|n| n as u64),
            scan_date: row.get(8)?,
            status,
            issues_found: row.get::<_, Option<i64>>(10)?.map(|n| n as u64),
            processed_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        }))
    }

    fn row_to_suggestion(row: &Row) -> rusqlite::Result<StoreResult<FileSuggestion>> {
        let status: String = row.get(4)?;
        let status = match status.parse::<SuggestionStatus>() {
            Ok(s) => s,
            Err(e) => return Ok(Err(e.into())),
        };
        let metadata: String = row.get(8)?;
        let metadata = match serde_json::from_str(&metadata) {
            Ok(v) => v,
            Err(e) => return Ok(Err(e.into())),
        };
        Ok(Ok(FileSuggestion {
            id: row.get(0)?,
            file_scan_id: row.get(1)?,
            file_path: row.get(2)?,
            suggestion: row.get(3)?,
            status,
            ai_model: row.get(5)?,
            token_count: row.get::<_, Option<i64>>(6)?.map(|n| n as u64),
            retry_count: row.get::<_, i64>(7)? as u32,
            metadata,
            error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        }))
    }
}
