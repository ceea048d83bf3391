//! Upload sessions: metadata rows in the index, chunk bytes in blob storage.
//!
//! All mutations of one session are serialized by a per-identifier async
//! lock; the assembler takes the same lock for finalize and abort.

use super::error::UploadError;
use super::storage::BlobStorage;
use crate::store::{FileUpload, NewUpload, ScanIndex};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

pub struct ChunkStore {
    index: Arc<ScanIndex>,
    storage: Arc<BlobStorage>,
    session_ttl: Duration,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ChunkStore {
    pub fn new(index: Arc<ScanIndex>, storage: Arc<BlobStorage>, session_ttl: Duration) -> Self {
        Self {
            index,
            storage,
            session_ttl,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive access to one session until the guard drops.
    pub async fn lock_session(&self, identifier: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(identifier.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry once nobody holds or awaits it. A later
    /// `lock_session` simply creates a fresh one.
    pub(crate) fn forget_lock(&self, identifier: &str) {
        let mut locks = self.locks.lock();
        if locks
            .get(identifier)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(identifier);
        }
    }

    pub fn get(&self, identifier: &str) -> Result<Option<FileUpload>, UploadError> {
        Ok(self.index.get_upload(identifier)?)
    }

    fn is_expired(&self, upload: &FileUpload) -> bool {
        let Ok(started) = DateTime::parse_from_rfc3339(&upload.started_at) else {
            return true;
        };
        let age = Utc::now().signed_duration_since(started.with_timezone(&Utc));
        age.to_std().is_ok_and(|age| age > self.session_ttl)
    }

    /// Start a session. An existing live session is a conflict; a session that
    /// expired or reached a terminal state is discarded and replaced.
    pub async fn init_session(&self, upload: NewUpload) -> Result<FileUpload, UploadError> {
        check_identifier(&upload.file_identifier)?;
        if upload.total_chunks == 0 {
            return Err(UploadError::InvalidRequest(
                "total_chunks must be at least 1".into(),
            ));
        }
        let identifier = upload.file_identifier.clone();
        let result = {
            let _guard = self.lock_session(&identifier).await;
            self.init_locked(upload).await
        };
        self.forget_lock(&identifier);
        result
    }

    async fn init_locked(&self, upload: NewUpload) -> Result<FileUpload, UploadError> {
        if let Some(existing) = self.index.get_upload(&upload.file_identifier)? {
            if !existing.status.is_terminal() && !self.is_expired(&existing) {
                return Err(UploadError::DuplicateSession(upload.file_identifier));
            }
            info!(
                file_identifier = %existing.file_identifier,
                status = %existing.status,
                "Replacing stale upload session"
            );
            self.discard_locked(&existing.file_identifier).await?;
        }
        let created = self.index.insert_upload(&upload)?;
        info!(
            file_identifier = %created.file_identifier,
            total_chunks = created.total_chunks,
            "Upload session started"
        );
        Ok(created)
    }

    /// Store one chunk. Re-sending an index overwrites it without
    /// changing the received count.
    pub async fn put_chunk(
        &self,
        identifier: &str,
        index: u32,
        bytes: &[u8],
    ) -> Result<FileUpload, UploadError> {
        check_identifier(identifier)?;
        let result = {
            let _guard = self.lock_session(identifier).await;
            self.put_chunk_locked(identifier, index, bytes).await
        };
        self.forget_lock(identifier);
        result
    }

    async fn put_chunk_locked(
        &self,
        identifier: &str,
        index: u32,
        bytes: &[u8],
    ) -> Result<FileUpload, UploadError> {
        let upload = self
            .index
            .get_upload(identifier)?
            .ok_or_else(|| UploadError::UnknownSession(identifier.to_string()))?;
        if index >= upload.total_chunks {
            return Err(UploadError::InvalidIndex {
                index,
                total: upload.total_chunks,
            });
        }
        if !upload.status.accepts_chunks() {
            return Err(UploadError::SessionClosed {
                identifier: identifier.to_string(),
                status: upload.status,
            });
        }
        let path = self.storage.put_chunk(identifier, index, bytes).await?;
        let updated =
            self.index
                .mark_chunk_received(identifier, index, bytes.len() as u64, &path)?;
        debug!(
            file_identifier = identifier,
            chunk = index,
            received = updated.received_chunks,
            total = updated.total_chunks,
            "Chunk stored"
        );
        Ok(updated)
    }

    pub fn is_complete(&self, identifier: &str) -> Result<bool, UploadError> {
        let upload = self
            .index
            .get_upload(identifier)?
            .ok_or_else(|| UploadError::UnknownSession(identifier.to_string()))?;
        Ok(upload.is_complete())
    }

    /// Delete the session and its chunk bytes. Missing sessions are a no-op;
    /// returns whether a session existed.
    pub async fn discard_session(&self, identifier: &str) -> Result<bool, UploadError> {
        check_identifier(identifier)?;
        let existed = {
            let _guard = self.lock_session(identifier).await;
            self.discard_locked(identifier).await?
        };
        self.forget_lock(identifier);
        Ok(existed)
    }

    /// Discard while the caller already holds the session lock.
    pub(crate) async fn discard_locked(&self, identifier: &str) -> Result<bool, UploadError> {
        self.storage.discard_chunks(identifier).await?;
        Ok(self.index.delete_upload(identifier)?)
    }

    pub(crate) fn index(&self) -> &ScanIndex {
        &self.index
    }

    pub(crate) fn storage(&self) -> &BlobStorage {
        &self.storage
    }
}

/// Identifiers are client supplied; a blank one names no session.
pub(crate) fn check_identifier(identifier: &str) -> Result<(), UploadError> {
    if identifier.trim().is_empty() {
        return Err(UploadError::InvalidRequest(
            "file_identifier must not be empty".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
impl ChunkStore {
    pub(crate) fn tracked_locks(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UploadStatus;
    use tempfile::TempDir;

    fn store(tmp: &TempDir, ttl: Duration) -> ChunkStore {
        ChunkStore::new(
            Arc::new(ScanIndex::open_in_memory().unwrap()),
            Arc::new(BlobStorage::from_path(tmp.path().to_path_buf())),
            ttl,
        )
    }

    fn upload(id: &str, total: u32) -> NewUpload {
        NewUpload {
            file_identifier: id.into(),
            site_url: "https://example.com".into(),
            theme: "demo".into(),
            file_path: "functions.php".into(),
            file_type: "php".into(),
            file_size: 12,
            total_chunks: total,
        }
    }

    #[tokio::test]
    async fn duplicate_live_session_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let chunks = store(&tmp, Duration::from_secs(3600));
        chunks.init_session(upload("u1", 2)).await.unwrap();
        let err = chunks.init_session(upload("u1", 2)).await.unwrap_err();
        assert!(matches!(err, UploadError::DuplicateSession(_)));
    }

    #[tokio::test]
    async fn expired_session_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let chunks = store(&tmp, Duration::ZERO);
        chunks.init_session(upload("u1", 2)).await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = chunks.init_session(upload("u1", 3)).await.unwrap();
        assert_eq!(fresh.total_chunks, 3);
        assert_eq!(fresh.received_chunks, 0);
        assert!(chunks.storage().read_chunk("u1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_chunk_errors() {
        let tmp = TempDir::new().unwrap();
        let chunks = store(&tmp, Duration::from_secs(3600));
        let err = chunks.put_chunk("nope", 0, b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::UnknownSession(_)));

        chunks.init_session(upload("u1", 2)).await.unwrap();
        let err = chunks.put_chunk("u1", 2, b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidIndex { index: 2, total: 2 }));
    }

    #[tokio::test]
    async fn resending_a_chunk_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let chunks = store(&tmp, Duration::from_secs(3600));
        chunks.init_session(upload("u1", 2)).await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        let after = chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        assert_eq!(after.received_chunks, 1);
        assert!(!chunks.is_complete("u1").unwrap());
        chunks.put_chunk("u1", 1, b"BBBB").await.unwrap();
        assert!(chunks.is_complete("u1").unwrap());
    }

    #[tokio::test]
    async fn concurrent_chunks_are_all_counted() {
        let tmp = TempDir::new().unwrap();
        let chunks = Arc::new(store(&tmp, Duration::from_secs(3600)));
        chunks.init_session(upload("u1", 16)).await.unwrap();
        let tasks: Vec<_> = (0..16u32)
            .map(|i| {
                let chunks = chunks.clone();
                tokio::spawn(async move { chunks.put_chunk("u1", i, &[i as u8]).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let upload = chunks.get("u1").unwrap().unwrap();
        assert_eq!(upload.received_chunks, 16);
        assert_eq!(upload.status, UploadStatus::Receiving);
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let chunks = store(&tmp, Duration::from_secs(3600));
        chunks.init_session(upload("u1", 1)).await.unwrap();
        assert!(chunks.discard_session("u1").await.unwrap());
        assert!(!chunks.discard_session("u1").await.unwrap());
        assert!(!chunks.discard_session("never").await.unwrap());
    }

    #[tokio::test]
    async fn blank_identifiers_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let chunks = store(&tmp, Duration::from_secs(3600));
        for id in ["", "   "] {
            let err = chunks.init_session(upload(id, 1)).await.unwrap_err();
            assert!(matches!(err, UploadError::InvalidRequest(_)));
            let err = chunks.put_chunk(id, 0, b"x").await.unwrap_err();
            assert!(matches!(err, UploadError::InvalidRequest(_)));
            let err = chunks.discard_session(id).await.unwrap_err();
            assert!(matches!(err, UploadError::InvalidRequest(_)));
        }
    }

    #[tokio::test]
    async fn discarding_other_identifiers_leaves_a_session_intact() {
        let tmp = TempDir::new().unwrap();
        let chunks = store(&tmp, Duration::from_secs(3600));
        chunks.init_session(upload("victim", 2)).await.unwrap();
        chunks.put_chunk("victim", 0, b"AAAA").await.unwrap();
        chunks.put_chunk("victim", 1, b"BBBB").await.unwrap();
        assert!(!chunks.discard_session(".").await.unwrap());
        assert!(!chunks.discard_session("..").await.unwrap());
        assert!(chunks.storage().read_chunk("victim", 0).await.unwrap().is_some());
        assert!(chunks.storage().read_chunk("victim", 1).await.unwrap().is_some());
        assert!(chunks.is_complete("victim").unwrap());
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_operations() {
        let tmp = TempDir::new().unwrap();
        let chunks = store(&tmp, Duration::from_secs(3600));
        chunks.put_chunk("nope", 0, b"x").await.unwrap_err();
        chunks.init_session(upload("u1", 2)).await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        chunks.init_session(upload("u1", 2)).await.unwrap_err();
        assert_eq!(chunks.tracked_locks(), 0);
    }
}
