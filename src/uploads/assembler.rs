//! Upload state machine: direct uploads, finalize and abort.
//!
//! ```text
//! init -> receiving --chunk--> receiving --finalize--> finalizing -> completed
//!                                         \-- incomplete: error, still receiving
//! receiving --abort--> discarded
//! ```

use super::chunk_store::{check_identifier, ChunkStore};
use super::error::UploadError;
use super::naming::storage_path;
use super::validate::validate;
use crate::metrics::Metrics;
use crate::scan::{Fingerprint, ScanRecorder};
use crate::store::{FileScan, NewScan, UploadStatus};
use std::sync::Arc;
use tracing::{info, warn};

/// A complete file sent in one request.
#[derive(Debug, Clone)]
pub struct DirectUpload {
    pub site_url: String,
    pub theme: String,
    pub file_path: String,
    pub file_type: String,
    pub content: Vec<u8>,
}

pub struct Assembler {
    chunks: Arc<ChunkStore>,
    recorder: Arc<ScanRecorder>,
    metrics: Metrics,
}

impl Assembler {
    pub fn new(chunks: Arc<ChunkStore>, recorder: Arc<ScanRecorder>, metrics: Metrics) -> Self {
        Self {
            chunks,
            recorder,
            metrics,
        }
    }

    pub fn chunks(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    /// Validate, store and record a single-request upload.
    pub async fn direct_upload(&self, upload: DirectUpload) -> Result<FileScan, UploadError> {
        validate(&upload.file_type, &upload.content)?;
        let scan = self
            .store(
                &upload.site_url,
                &upload.theme,
                &upload.file_path,
                &upload.file_type,
                &upload.content,
            )
            .await?;
        self.metrics
            .uploads_received
            .with_label_values(&["direct"])
            .inc();
        Ok(scan)
    }

    async fn store(
        &self,
        site_url: &str,
        theme: &str,
        file_path: &str,
        file_type: &str,
        bytes: &[u8],
    ) -> Result<FileScan, UploadError> {
        let rel = storage_path(site_url, file_path, file_type);
        self.chunks.storage().put(&rel, bytes).await?;
        let fingerprint = Fingerprint::of(bytes);
        let scan = self.recorder.record_upload(&NewScan {
            site_url: site_url.to_string(),
            theme: theme.to_string(),
            file_path: file_path.to_string(),
            file_type: file_type.to_string(),
            storage_path: Some(rel.clone()),
            content_hash: Some(fingerprint.content_hash),
            byte_len: Some(fingerprint.byte_len),
        });
        match scan {
            Ok(scan) => {
                info!(scan_id = scan.id, path = %rel, bytes = bytes.len(), "File stored");
                Ok(scan)
            }
            Err(e) => {
                // no scan points at the bytes; don't leave them behind
                if let Err(cleanup) = self.chunks.storage().delete(&rel).await {
                    warn!(path = %rel, "Orphaned upload not removed: {cleanup:#}");
                }
                Err(e.into())
            }
        }
    }

    /// Assemble a complete session into one stored file.
    ///
    /// Chunks are concatenated strictly in index order. The session lock is
    /// held throughout, so no chunk write can land once assembly starts.
    /// `declared_total`, when the client sends it, must match the session.
    pub async fn finalize(
        &self,
        identifier: &str,
        declared_total: Option<u32>,
    ) -> Result<FileScan, UploadError> {
        check_identifier(identifier)?;
        let result = {
            let _guard = self.chunks.lock_session(identifier).await;
            self.finalize_locked(identifier, declared_total).await
        };
        self.chunks.forget_lock(identifier);
        if result.is_ok() {
            self.metrics.uploads_finalized.inc();
        }
        result
    }

    async fn finalize_locked(
        &self,
        identifier: &str,
        declared_total: Option<u32>,
    ) -> Result<FileScan, UploadError> {
        let index = self.chunks.index();
        let upload = index
            .get_upload(identifier)?
            .ok_or_else(|| UploadError::UnknownSession(identifier.to_string()))?;
        if let Some(declared) = declared_total.filter(|d| *d != upload.total_chunks) {
            return Err(UploadError::ChunkCountMismatch {
                declared,
                expected: upload.total_chunks,
            });
        }
        if upload.status != UploadStatus::Receiving {
            return Err(UploadError::SessionClosed {
                identifier: identifier.to_string(),
                status: upload.status,
            });
        }
        if !upload.is_complete() {
            return Err(UploadError::IncompleteUpload {
                received: upload.received_chunks,
                expected: upload.total_chunks,
            });
        }
        index.transition_upload(identifier, UploadStatus::Finalizing, None)?;

        let mut assembled = Vec::new();
        for chunk in 0..upload.total_chunks {
            match self.chunks.storage().read_chunk(identifier, chunk).await {
                Ok(Some(bytes)) => assembled.extend_from_slice(&bytes),
                Ok(None) => {
                    warn!(file_identifier = identifier, chunk, "Chunk marked received but missing");
                    index.unmark_chunk(identifier, chunk)?;
                    index.transition_upload(identifier, UploadStatus::Receiving, None)?;
                    return Err(UploadError::MissingChunk { index: chunk });
                }
                Err(e) => {
                    index.transition_upload(identifier, UploadStatus::Receiving, None)?;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = validate(&upload.file_type, &assembled) {
            self.fail_locked(identifier, &e.to_string()).await;
            return Err(e.into());
        }
        let scan = match self
            .store(
                &upload.site_url,
                &upload.theme,
                &upload.file_path,
                &upload.file_type,
                &assembled,
            )
            .await
        {
            Ok(scan) => scan,
            Err(e) => {
                self.fail_locked(identifier, &e.to_string()).await;
                return Err(e);
            }
        };

        index.transition_upload(identifier, UploadStatus::Completed, None)?;
        self.chunks.discard_locked(identifier).await?;
        info!(
            file_identifier = identifier,
            scan_id = scan.id,
            chunks = upload.total_chunks,
            bytes = assembled.len(),
            "Upload finalized"
        );
        Ok(scan)
    }

    async fn fail_locked(&self, identifier: &str, reason: &str) {
        warn!(file_identifier = identifier, reason, "Upload rejected at finalize");
        let index = self.chunks.index();
        if let Err(e) = index.transition_upload(identifier, UploadStatus::Failed, Some(reason)) {
            warn!(file_identifier = identifier, "Could not mark upload failed: {e}");
        }
        if let Err(e) = self.chunks.discard_locked(identifier).await {
            warn!(file_identifier = identifier, "Could not discard failed upload: {e}");
        }
    }

    /// Drop a session and its chunks. Unknown or already-discarded sessions
    /// are fine; returns whether anything was removed.
    pub async fn abort(&self, identifier: &str, reason: Option<&str>) -> Result<bool, UploadError> {
        let existed = self.chunks.discard_session(identifier).await?;
        info!(
            file_identifier = identifier,
            reason = reason.unwrap_or("unspecified"),
            existed,
            "Upload aborted"
        );
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewUpload, ScanIndex, ScanStatus};
    use crate::uploads::BlobStorage;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        assembler: Assembler,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(ScanIndex::open_in_memory().unwrap());
        let storage = Arc::new(BlobStorage::from_path(tmp.path().to_path_buf()));
        let metrics = Metrics::new().unwrap();
        let chunks = Arc::new(ChunkStore::new(
            index.clone(),
            storage.clone(),
            Duration::from_secs(3600),
        ));
        let recorder = Arc::new(ScanRecorder::new(index, storage, metrics.clone()));
        Harness {
            _tmp: tmp,
            assembler: Assembler::new(chunks, recorder, metrics),
        }
    }

    fn session(id: &str, file_type: &str, total: u32) -> NewUpload {
        NewUpload {
            file_identifier: id.into(),
            site_url: "https://www.example.com/".into(),
            theme: "demo".into(),
            file_path: format!("notes.{file_type}"),
            file_type: file_type.into(),
            file_size: 12,
            total_chunks: total,
        }
    }

    async fn stored_bytes(h: &Harness, scan: &FileScan) -> Vec<u8> {
        let rel = scan.storage_path.as_deref().unwrap();
        h.assembler.chunks().storage().read(rel).await.unwrap()
    }

    #[tokio::test]
    async fn three_chunks_assemble_in_order() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("u1", "txt", 3)).await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        chunks.put_chunk("u1", 1, b"BBBB").await.unwrap();
        chunks.put_chunk("u1", 2, b"CCCC").await.unwrap();
        let scan = h.assembler.finalize("u1", Some(3)).await.unwrap();
        assert_eq!(stored_bytes(&h, &scan).await, b"AAAABBBBCCCC");
        assert_eq!(scan.status, ScanStatus::Pending);
        assert!(scan
            .storage_path
            .as_deref()
            .unwrap()
            .starts_with("wordpress/other/example-com/"));
        assert!(chunks.get("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn arrival_order_does_not_matter() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("u1", "txt", 3)).await.unwrap();
        chunks.put_chunk("u1", 2, b"CCCC").await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        chunks.put_chunk("u1", 1, b"BBBB").await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        let scan = h.assembler.finalize("u1", None).await.unwrap();
        assert_eq!(stored_bytes(&h, &scan).await, b"AAAABBBBCCCC");
    }

    #[tokio::test]
    async fn incomplete_finalize_reports_counts_and_stays_open() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("u1", "txt", 3)).await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        let err = h.assembler.finalize("u1", Some(3)).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompleteUpload {
                received: 1,
                expected: 3
            }
        ));
        chunks.put_chunk("u1", 1, b"BBBB").await.unwrap();
        chunks.put_chunk("u1", 2, b"CCCC").await.unwrap();
        assert!(h.assembler.finalize("u1", Some(3)).await.is_ok());
    }

    #[tokio::test]
    async fn declared_count_must_match() {
        let h = harness();
        h.assembler.chunks().init_session(session("u1", "txt", 2)).await.unwrap();
        let err = h.assembler.finalize("u1", Some(3)).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::ChunkCountMismatch {
                declared: 3,
                expected: 2
            }
        ));
        let err = h.assembler.finalize("nope", None).await.unwrap_err();
        assert!(matches!(err, UploadError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn missing_chunk_bytes_reopen_the_session() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("u1", "txt", 2)).await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        chunks.put_chunk("u1", 1, b"BBBB").await.unwrap();
        let rel = BlobStorage::chunk_path("u1", 1);
        chunks.storage().delete(&rel).await.unwrap();

        let err = h.assembler.finalize("u1", None).await.unwrap_err();
        assert!(matches!(err, UploadError::MissingChunk { index: 1 }));
        let upload = chunks.get("u1").unwrap().unwrap();
        assert_eq!(upload.status, UploadStatus::Receiving);
        assert_eq!(upload.received_chunks, 1);

        chunks.put_chunk("u1", 1, b"BBBB").await.unwrap();
        let scan = h.assembler.finalize("u1", None).await.unwrap();
        assert_eq!(stored_bytes(&h, &scan).await, b"AAAABBBB");
    }

    #[tokio::test]
    async fn invalid_content_fails_the_session() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("u1", "php", 1)).await.unwrap();
        chunks.put_chunk("u1", 0, b"echo 'no tag';").await.unwrap();
        let err = h.assembler.finalize("u1", None).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert!(chunks.get("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_upload_releases_its_lock() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("u1", "php", 1)).await.unwrap();
        chunks.put_chunk("u1", 0, b"no tag").await.unwrap();
        h.assembler.finalize("u1", None).await.unwrap_err();
        h.assembler.finalize("u1", None).await.unwrap_err();
        assert_eq!(chunks.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn blank_identifier_cannot_touch_other_sessions() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("victim", "txt", 2)).await.unwrap();
        chunks.put_chunk("victim", 0, b"AAAA").await.unwrap();
        chunks.put_chunk("victim", 1, b"BBBB").await.unwrap();
        assert!(matches!(
            h.assembler.abort("", None).await.unwrap_err(),
            UploadError::InvalidRequest(_)
        ));
        assert!(!h.assembler.abort(".", None).await.unwrap());
        let scan = h.assembler.finalize("victim", None).await.unwrap();
        assert_eq!(stored_bytes(&h, &scan).await, b"AAAABBBB");
    }

    #[tokio::test]
    async fn lookalike_identifiers_assemble_their_own_bytes() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("a/b", "txt", 2)).await.unwrap();
        chunks.init_session(session("a_b", "txt", 2)).await.unwrap();
        chunks.put_chunk("a/b", 0, b"AAAA").await.unwrap();
        chunks.put_chunk("a_b", 0, b"XXXX").await.unwrap();
        chunks.put_chunk("a/b", 1, b"BBBB").await.unwrap();
        chunks.put_chunk("a_b", 1, b"YYYY").await.unwrap();
        let first = h.assembler.finalize("a/b", None).await.unwrap();
        let second = h.assembler.finalize("a_b", None).await.unwrap();
        assert_eq!(stored_bytes(&h, &first).await, b"AAAABBBB");
        assert_eq!(stored_bytes(&h, &second).await, b"XXXXYYYY");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn late_chunk_and_finalize_never_mix() {
        let h = Arc::new(harness());
        for round in 0..20 {
            let id = format!("race-{round}");
            let chunks = h.assembler.chunks();
            chunks.init_session(session(&id, "txt", 2)).await.unwrap();
            chunks.put_chunk(&id, 0, b"AAAA").await.unwrap();
            chunks.put_chunk(&id, 1, b"BBBB").await.unwrap();

            let resend = {
                let h = h.clone();
                let id = id.clone();
                tokio::spawn(async move { h.assembler.chunks().put_chunk(&id, 1, b"ZZZZ").await })
            };
            let finalize = {
                let h = h.clone();
                let id = id.clone();
                tokio::spawn(async move { h.assembler.finalize(&id, None).await })
            };
            let resent = resend.await.unwrap();
            let scan = finalize.await.unwrap().unwrap();
            let bytes = stored_bytes(&h, &scan).await;
            match resent {
                Ok(_) => assert_eq!(bytes, b"AAAAZZZZ"),
                Err(err) => {
                    assert!(matches!(
                        err,
                        UploadError::UnknownSession(_) | UploadError::SessionClosed { .. }
                    ));
                    assert_eq!(bytes, b"AAAABBBB");
                }
            }
        }
    }

    #[tokio::test]
    async fn chunks_after_finalize_are_rejected() {
        let h = harness();
        let chunks = h.assembler.chunks();
        chunks.init_session(session("u1", "txt", 1)).await.unwrap();
        chunks.put_chunk("u1", 0, b"AAAA").await.unwrap();
        h.assembler.finalize("u1", None).await.unwrap();
        let err = chunks.put_chunk("u1", 0, b"late").await.unwrap_err();
        assert!(matches!(err, UploadError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let h = harness();
        h.assembler.chunks().init_session(session("u1", "txt", 2)).await.unwrap();
        h.assembler.chunks().put_chunk("u1", 0, b"AAAA").await.unwrap();
        assert!(h.assembler.abort("u1", Some("user cancelled")).await.unwrap());
        assert!(!h.assembler.abort("u1", None).await.unwrap());
        assert!(!h.assembler.abort("never-started", None).await.unwrap());
    }

    #[tokio::test]
    async fn direct_upload_validates_and_records() {
        let h = harness();
        let scan = h
            .assembler
            .direct_upload(DirectUpload {
                site_url: "https://example.com".into(),
                theme: "demo".into(),
                file_path: "wp-content/themes/demo/functions.php".into(),
                file_type: "php".into(),
                content: b"<?php add_action('init', 'demo');".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(scan.byte_len, Some(33));
        assert!(scan
            .storage_path
            .as_deref()
            .unwrap()
            .ends_with("_wp-content_themes_demo_functions.php"));

        let err = h
            .assembler
            .direct_upload(DirectUpload {
                site_url: "https://example.com".into(),
                theme: "demo".into(),
                file_path: "style.css".into(),
                file_type: "css".into(),
                content: b"plain words".to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }
}
