//! Upload-session rows. Every read-modify-write runs inside one
//! SQLite transaction while the connection mutex is held.

use super::index::{flatten, now_timestamp, ScanIndex, StoreError, StoreResult};
use super::schema::{FileUpload, FileUploadChunk};
use super::status::UploadStatus;
use rusqlite::{params, Connection, OptionalExtension, Row};

const UPLOAD_COLUMNS: &str = "id, file_identifier, site_url, theme, file_path, file_type,
     file_size, status, total_chunks, received_chunks, chunk_status, started_at, failure_reason";

/// Metadata captured when a chunked upload is initialised.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub file_identifier: String,
    pub site_url: String,
    pub theme: String,
    pub file_path: String,
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u32,
}

impl ScanIndex {
    /// Insert a session in `receiving` with a zeroed bitmap.
    pub fn insert_upload(&self, upload: &NewUpload) -> StoreResult<FileUpload> {
        let status = UploadStatus::Pending.transition(UploadStatus::Receiving)?;
        let bitmap = vec![false; upload.total_chunks as usize];
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO file_uploads (file_identifier, site_url, theme, file_path, file_type,
             file_size, status, total_chunks, received_chunks, chunk_status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)",
            params![
                upload.file_identifier,
                upload.site_url,
                upload.theme,
                upload.file_path,
                upload.file_type,
                upload.file_size as i64,
                status.as_str(),
                upload.total_chunks,
                serde_json::to_string(&bitmap)?,
                now_timestamp(),
            ],
        )?;
        Self::fetch_upload(&conn, &upload.file_identifier)?
            .ok_or_else(|| StoreError::NotFound(upload.file_identifier.clone()))
    }

    pub fn get_upload(&self, identifier: &str) -> StoreResult<Option<FileUpload>> {
        let conn = self.conn.lock();
        Self::fetch_upload(&conn, identifier)
    }

    fn fetch_upload(conn: &Connection, identifier: &str) -> StoreResult<Option<FileUpload>> {
        let sql = format!("SELECT {UPLOAD_COLUMNS} FROM file_uploads WHERE file_identifier = ?1");
        let row = conn
            .query_row(&sql, params![identifier], Self::row_to_upload)
            .optional()?;
        row.transpose()
    }

    /// Record one received chunk. Re-sending an index overwrites its row and
    /// leaves the received count unchanged.
    pub fn mark_chunk_received(
        &self,
        identifier: &str,
        index: u32,
        chunk_size: u64,
        chunk_path: &str,
    ) -> StoreResult<FileUpload> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut upload = Self::fetch_upload(&tx, identifier)?
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))?;
        if !upload.status.accepts_chunks() {
            return Err(StoreError::Conflict(format!(
                "upload {identifier} is {} and no longer accepts chunks",
                upload.status
            )));
        }
        if index >= upload.total_chunks {
            return Err(StoreError::Conflict(format!(
                "chunk index {index} out of range for {} chunks",
                upload.total_chunks
            )));
        }
        let now = now_timestamp();
        tx.execute(
            "INSERT INTO file_upload_chunks (upload_id, chunk_index, chunk_size, chunk_path,
             is_received, received_at) VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(upload_id, chunk_index) DO UPDATE SET
                chunk_size = excluded.chunk_size,
                chunk_path = excluded.chunk_path,
                is_received = 1,
                received_at = excluded.received_at",
            params![upload.id, index, chunk_size as i64, chunk_path, now],
        )?;
        upload.chunk_status[index as usize] = true;
        upload.received_chunks = upload.chunk_status.iter().filter(|r| **r).count() as u32;
        Self::save_bitmap(&tx, &upload)?;
        tx.commit()?;
        Ok(upload)
    }

    /// Clear a chunk's received flag, used when its bytes vanished from storage.
    pub fn unmark_chunk(&self, identifier: &str, index: u32) -> StoreResult<FileUpload> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut upload = Self::fetch_upload(&tx, identifier)?
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))?;
        if let Some(flag) = upload.chunk_status.get_mut(index as usize) {
            *flag = false;
        }
        upload.received_chunks = upload.chunk_status.iter().filter(|r| **r).count() as u32;
        tx.execute(
            "UPDATE file_upload_chunks SET is_received = 0 WHERE upload_id = ?1 AND chunk_index = ?2",
            params![upload.id, index],
        )?;
        Self::save_bitmap(&tx, &upload)?;
        tx.commit()?;
        Ok(upload)
    }

    fn save_bitmap(conn: &Connection, upload: &FileUpload) -> StoreResult<()> {
        conn.execute(
            "UPDATE file_uploads SET chunk_status = ?1, received_chunks = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&upload.chunk_status)?,
                upload.received_chunks,
                upload.id
            ],
        )?;
        Ok(())
    }

    /// Compare-and-set on the session status through the upload transition table.
    pub fn transition_upload(
        &self,
        identifier: &str,
        to: UploadStatus,
        failure_reason: Option<&str>,
    ) -> StoreResult<FileUpload> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut upload = Self::fetch_upload(&tx, identifier)?
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))?;
        upload.status = upload.status.transition(to)?;
        tx.execute(
            "UPDATE file_uploads SET status = ?1, failure_reason = COALESCE(?2, failure_reason)
             WHERE id = ?3",
            params![to.as_str(), failure_reason, upload.id],
        )?;
        tx.commit()?;
        if let Some(reason) = failure_reason {
            upload.failure_reason = Some(reason.to_string());
        }
        Ok(upload)
    }

    /// Received chunk rows in index order.
    pub fn received_chunks(&self, upload_id: i64) -> StoreResult<Vec<FileUploadChunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT upload_id, chunk_index, chunk_size, chunk_path, is_received, received_at
             FROM file_upload_chunks WHERE upload_id = ?1 AND is_received = 1
             ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![upload_id], |row| {
            Ok(FileUploadChunk {
                upload_id: row.get(0)?,
                chunk_index: row.get(1)?,
                chunk_size: row.get::<_, i64>(2)? as u64,
                chunk_path: row.get(3)?,
                is_received: row.get(4)?,
                received_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Remove a session and its chunk rows. Returns false when nothing existed.
    pub fn delete_upload(&self, identifier: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM file_uploads WHERE file_identifier = ?1",
            params![identifier],
        )?;
        Ok(n > 0)
    }

    pub fn uploads_started_before(&self, before: &str) -> StoreResult<Vec<FileUpload>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {UPLOAD_COLUMNS} FROM file_uploads WHERE started_at < ?1 ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![before], Self::row_to_upload)?;
        rows.map(flatten).collect()
    }

    fn row_to_upload(row: &Row) -> rusqlite::Result<StoreResult<FileUpload>> {
        let status: String = row.get(7)?;
        let status = match status.parse::<UploadStatus>() {
            Ok(s) => s,
            Err(e) => return Ok(Err(e.into())),
        };
        let bitmap: String = row.get(10)?;
        let chunk_status: Vec<bool> = match serde_json::from_str(&bitmap) {
            Ok(v) => v,
            Err(e) => return Ok(Err(e.into())),
        };
        Ok(Ok(FileUpload {
            id: row.get(0)?,
            file_identifier: row.get(1)?,
            site_url: row.get(2)?,
            theme: row.get(3)?,
            file_path: row.get(4)?,
            file_type: row.get(5)?,
            file_size: row.get::<_, i64>(6)? as u64,
            status,
            total_chunks: row.get(8)?,
            received_chunks: row.get(9)?,
            chunk_status,
            started_at: row.get(11)?,
            failure_reason: row.get(12)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_upload(id: &str, total: u32) -> NewUpload {
        NewUpload {
            file_identifier: id.into(),
            site_url: "https://example.com".into(),
            theme: "example".into(),
            file_path: "wp-content/themes/example/style.css".into(),
            file_type: "css".into(),
            file_size: 12,
            total_chunks: total,
        }
    }

    #[test]
    fn bitmap_starts_zeroed_with_total_length() {
        let index = ScanIndex::open_in_memory().unwrap();
        let upload = index.insert_upload(&new_upload("u1", 4)).unwrap();
        assert_eq!(upload.status, UploadStatus::Receiving);
        assert_eq!(upload.chunk_status, vec![false; 4]);
        assert_eq!(upload.received_chunks, 0);
    }

    #[test]
    fn duplicate_chunk_does_not_double_count() {
        let index = ScanIndex::open_in_memory().unwrap();
        index.insert_upload(&new_upload("u1", 3)).unwrap();
        index.mark_chunk_received("u1", 1, 4, "c1").unwrap();
        let upload = index.mark_chunk_received("u1", 1, 4, "c1").unwrap();
        assert_eq!(upload.received_chunks, 1);
        assert_eq!(upload.chunk_status, vec![false, true, false]);
    }

    #[test]
    fn out_of_range_index_is_a_conflict() {
        let index = ScanIndex::open_in_memory().unwrap();
        index.insert_upload(&new_upload("u1", 2)).unwrap();
        let err = index.mark_chunk_received("u1", 2, 1, "c2").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn chunks_rejected_once_finalizing() {
        let index = ScanIndex::open_in_memory().unwrap();
        index.insert_upload(&new_upload("u1", 1)).unwrap();
        index.transition_upload("u1", UploadStatus::Finalizing, None).unwrap();
        let err = index.mark_chunk_received("u1", 0, 1, "c0").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn delete_cascades_chunk_rows() {
        let index = ScanIndex::open_in_memory().unwrap();
        let upload = index.insert_upload(&new_upload("u1", 2)).unwrap();
        index.mark_chunk_received("u1", 0, 1, "c0").unwrap();
        assert!(index.delete_upload("u1").unwrap());
        assert!(!index.delete_upload("u1").unwrap());
        assert!(index.received_chunks(upload.id).unwrap().is_empty());
    }

    #[test]
    fn unmark_reopens_a_chunk() {
        let index = ScanIndex::open_in_memory().unwrap();
        let upload = index.insert_upload(&new_upload("u1", 2)).unwrap();
        index.mark_chunk_received("u1", 0, 1, "c0").unwrap();
        index.mark_chunk_received("u1", 1, 1, "c1").unwrap();
        let after = index.unmark_chunk("u1", 1).unwrap();
        assert_eq!(after.received_chunks, 1);
        assert_eq!(index.received_chunks(upload.id).unwrap().len(), 1);
    }
}
