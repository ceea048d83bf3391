//! Housekeeping: old scans, stale upload sessions and stuck scans.

use super::recorder::ScanRecorder;
use crate::store::{timestamp_ago, FileScan, ScanStatus};
use crate::uploads::ChunkStore;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupReport {
    pub deleted: usize,
    pub archived: usize,
    pub bundles_removed: usize,
    /// Stored source files removed from the blob tree.
    pub sources_removed: usize,
    /// Scans left alone because a worker owns them.
    pub in_flight: usize,
}

pub struct Retention {
    recorder: Arc<ScanRecorder>,
    chunks: Arc<ChunkStore>,
}

impl Retention {
    pub fn new(recorder: Arc<ScanRecorder>, chunks: Arc<ChunkStore>) -> Self {
        Self { recorder, chunks }
    }

    /// Delete (or archive) at most `limit` scans last touched more than
    /// `days` ago. Deleting drops the suggestion and its bundle file; both
    /// modes remove the stored source file unless another scan still points
    /// at it.
    pub async fn cleanup_scans(&self, days: u32, archive: bool, limit: usize) -> Result<CleanupReport> {
        let cutoff = timestamp_ago(Duration::from_secs(u64::from(days) * 86_400));
        let index = self.recorder.index();
        let mut report = CleanupReport::default();
        for scan in index.scans_older_than(&cutoff, !archive, limit)? {
            if scan.status.is_in_flight() {
                report.in_flight += 1;
                continue;
            }
            if archive {
                if let Err(e) = index.transition_scan(scan.id, ScanStatus::Archived) {
                    warn!(scan_id = scan.id, "Not archived: {e}");
                    continue;
                }
                report.archived += 1;
            } else {
                match self.recorder.delete_bundle(scan.id).await {
                    Ok(true) => report.bundles_removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(scan_id = scan.id, "Bundle not removed: {e:#}"),
                }
                if !index.delete_scan(scan.id)? {
                    continue;
                }
                report.deleted += 1;
            }
            match self.remove_source(&scan).await {
                Ok(true) => report.sources_removed += 1,
                Ok(false) => {}
                Err(e) => warn!(scan_id = scan.id, "Source file not removed: {e:#}"),
            }
        }
        info!(
            days,
            deleted = report.deleted,
            archived = report.archived,
            bundles = report.bundles_removed,
            sources = report.sources_removed,
            "Old scans cleaned up"
        );
        Ok(report)
    }

    /// Delete the scan's stored bytes when no other scan references them.
    async fn remove_source(&self, scan: &FileScan) -> Result<bool> {
        let Some(path) = scan.storage_path.as_deref() else {
            return Ok(false);
        };
        if self.recorder.index().storage_path_refs(path, scan.id)? > 0 {
            return Ok(false);
        }
        let storage = self.recorder.storage();
        if !storage.exists(path).await? {
            return Ok(false);
        }
        storage.delete(path).await?;
        Ok(true)
    }

    /// Discard upload sessions started longer than `ttl` ago.
    pub async fn purge_sessions(&self, ttl: Duration) -> Result<usize> {
        let cutoff = timestamp_ago(ttl);
        let mut purged = 0;
        for upload in self.recorder.index().uploads_started_before(&cutoff)? {
            if self.chunks.discard_session(&upload.file_identifier).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Stale upload sessions discarded");
        }
        Ok(purged)
    }

    /// Reset scans stuck in `processing` for longer than `age` to `queued`.
    /// Returns their ids so the caller can dispatch them.
    pub fn reset_stuck(&self, age: Duration, limit: usize) -> Result<Vec<i64>> {
        let cutoff = timestamp_ago(age);
        let index = self.recorder.index();
        let mut reset = Vec::new();
        for scan in index.stuck_scans(&cutoff, limit)? {
            match index.transition_scan(scan.id, ScanStatus::Queued) {
                Ok(_) => {
                    warn!(scan_id = scan.id, since = %scan.updated_at, "Reset stuck scan");
                    reset.push(scan.id);
                }
                Err(e) => warn!(scan_id = scan.id, "Stuck scan not reset: {e}"),
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::store::{NewScan, NewUpload, ScanIndex};
    use crate::uploads::BlobStorage;
    use tempfile::TempDir;

    fn retention(tmp: &TempDir) -> Retention {
        let index = Arc::new(ScanIndex::open_in_memory().unwrap());
        let storage = Arc::new(BlobStorage::from_path(tmp.path().to_path_buf()));
        let recorder = Arc::new(ScanRecorder::new(index.clone(), storage.clone(), Metrics::new().unwrap()));
        let chunks = Arc::new(ChunkStore::new(index, storage, Duration::from_secs(3600)));
        Retention::new(recorder, chunks)
    }

    fn scan(r: &Retention, path: &str) -> i64 {
        r.recorder
            .record_upload(&NewScan {
                site_url: "https://example.com".into(),
                file_path: path.into(),
                file_type: "php".into(),
                storage_path: Some(format!("wordpress/php/example-com/{path}")),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn cleanup_deletes_scans_and_bundles() {
        let tmp = TempDir::new().unwrap();
        let r = retention(&tmp);
        let id = scan(&r, "a.php");
        let started = r.recorder.start(&r.recorder.index().get_scan(id).unwrap().unwrap()).unwrap();
        r.recorder
            .complete_without_analysis(&started, "empty file")
            .await
            .unwrap();
        let busy = scan(&r, "b.php");
        r.recorder.index().transition_scan(busy, ScanStatus::Processing).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = r.cleanup_scans(0, false, 100).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.bundles_removed, 1);
        assert_eq!(report.in_flight, 1);
        assert!(r.recorder.index().get_scan(id).unwrap().is_none());
        assert!(r.recorder.index().suggestion_for_scan(id).unwrap().is_none());
        assert!(!r
            .recorder
            .storage()
            .exists("wordpress/php/example-com/suggestions/a_suggestions.json")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cleanup_can_archive() {
        let tmp = TempDir::new().unwrap();
        let r = retention(&tmp);
        let id = scan(&r, "a.php");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = r.cleanup_scans(0, true, 100).await.unwrap();
        assert_eq!(report.archived, 1);
        let scan = r.recorder.index().get_scan(id).unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Archived);
    }

    async fn stored_scan(r: &Retention, path: &str, storage_path: &str) -> i64 {
        r.recorder.storage().put(storage_path, b"<?php").await.unwrap();
        r.recorder
            .record_upload(&NewScan {
                site_url: "https://example.com".into(),
                file_path: path.into(),
                file_type: "php".into(),
                storage_path: Some(storage_path.into()),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn cleanup_removes_stored_sources_in_both_modes() {
        let tmp = TempDir::new().unwrap();
        let r = retention(&tmp);
        let storage = r.recorder.storage().clone();
        stored_scan(&r, "a.php", "wordpress/php/example-com/a.php").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = r.cleanup_scans(0, true, 100).await.unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(report.sources_removed, 1);
        assert!(!storage.exists("wordpress/php/example-com/a.php").await.unwrap());

        stored_scan(&r, "b.php", "wordpress/php/example-com/b.php").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = r.cleanup_scans(0, false, 100).await.unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(report.sources_removed, 1);
        assert!(!storage.exists("wordpress/php/example-com/b.php").await.unwrap());
    }

    #[tokio::test]
    async fn shared_source_survives_until_its_last_scan() {
        let tmp = TempDir::new().unwrap();
        let r = retention(&tmp);
        let shared = "wordpress/php/example-com/shared.php";
        stored_scan(&r, "shared.php", shared).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = stored_scan(&r, "shared.php", shared).await;

        let report = r.cleanup_scans(0, false, 1).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.sources_removed, 0);
        assert!(r.recorder.storage().exists(shared).await.unwrap());
        assert!(r.recorder.index().get_scan(newer).unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_honors_the_limit() {
        let tmp = TempDir::new().unwrap();
        let r = retention(&tmp);
        for name in ["a.php", "b.php", "c.php"] {
            scan(&r, name);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(r.cleanup_scans(0, false, 2).await.unwrap().deleted, 2);
        assert_eq!(r.cleanup_scans(0, false, 2).await.unwrap().deleted, 1);
    }

    #[tokio::test]
    async fn recent_scans_are_kept() {
        let tmp = TempDir::new().unwrap();
        let r = retention(&tmp);
        scan(&r, "a.php");
        let report = r.cleanup_scans(30, false, 100).await.unwrap();
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn stale_sessions_are_purged() {
        let tmp = TempDir::new().unwrap();
        let r = retention(&tmp);
        r.chunks
            .init_session(NewUpload {
                file_identifier: "old".into(),
                site_url: "https://example.com".into(),
                theme: String::new(),
                file_path: "a.php".into(),
                file_type: "php".into(),
                file_size: 4,
                total_chunks: 1,
            })
            .await
            .unwrap();
        r.chunks.put_chunk("old", 0, b"AAAA").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(r.purge_sessions(Duration::ZERO).await.unwrap(), 1);
        assert!(r.chunks.get("old").unwrap().is_none());
        assert_eq!(r.purge_sessions(Duration::ZERO).await.unwrap(), 0);
    }

    #[test]
    fn stuck_scans_go_back_to_queued() {
        let tmp = TempDir::new().unwrap();
        let r = retention(&tmp);
        let id = scan(&r, "a.php");
        r.recorder.index().transition_scan(id, ScanStatus::Processing).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(r.reset_stuck(Duration::ZERO, 5).unwrap(), vec![id]);
        let scan = r.recorder.index().get_scan(id).unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Queued);
        assert!(r.reset_stuck(Duration::ZERO, 5).unwrap().is_empty());
    }
}
