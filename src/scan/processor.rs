use super::change::{ChangeDetector, Fingerprint};
use super::recorder::ScanRecorder;
use crate::analysis::{AnalysisPipeline, PipelineError};
use crate::store::{FileScan, ScanStatus, StoreError};
use crate::uploads::kind::{is_analyzable_path, FileKind};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("scan {0} not found")]
    NotFound(i64),
    #[error("scan {0} has no stored file")]
    NoStoredFile(i64),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl ProcessError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NotFound(_) | Self::NoStoredFile(_) | Self::Pipeline(PipelineError::Cancelled(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Analyzed { issues: u64 },
    /// Same content as an earlier completed scan.
    Unchanged { previous_scan: i64 },
    Empty,
    NotAnalyzable,
    AlreadyCompleted,
}

/// Runs one scan from its stored bytes to a terminal status.
pub struct ScanProcessor {
    recorder: Arc<ScanRecorder>,
    detector: ChangeDetector,
    pipeline: Arc<AnalysisPipeline>,
}

impl ScanProcessor {
    pub fn new(recorder: Arc<ScanRecorder>, pipeline: Arc<AnalysisPipeline>) -> Self {
        Self {
            detector: ChangeDetector::new(recorder.index().clone()),
            recorder,
            pipeline,
        }
    }

    pub fn recorder(&self) -> &Arc<ScanRecorder> {
        &self.recorder
    }

    /// Process a scan. Failures leave the scan `failed`; a cancelled run puts
    /// it back on `queued` so it is picked up again.
    pub async fn process(
        &self,
        scan_id: i64,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ProcessError> {
        let scan = self
            .recorder
            .index()
            .get_scan(scan_id)?
            .ok_or(ProcessError::NotFound(scan_id))?;
        if scan.status == ScanStatus::Completed {
            info!(scan_id, "Scan already completed; nothing to do");
            return Ok(ScanOutcome::AlreadyCompleted);
        }
        let scan = self.recorder.start(&scan)?;

        match self.run(&scan, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(ProcessError::Pipeline(PipelineError::Cancelled(file))) => {
                warn!(scan_id, "Analysis cancelled; returning scan to the queue");
                self.recorder
                    .index()
                    .transition_scan(scan_id, ScanStatus::Queued)?;
                Err(ProcessError::Pipeline(PipelineError::Cancelled(file)))
            }
            Err(e) => {
                if let Err(mark) = self.recorder.mark_failed(scan_id, &e.to_string()) {
                    warn!(scan_id, "Could not record scan failure: {mark}");
                }
                Err(e)
            }
        }
    }

    async fn run(&self, scan: &FileScan, cancel: &CancellationToken) -> Result<ScanOutcome, ProcessError> {
        let storage_path = scan
            .storage_path
            .as_deref()
            .ok_or(ProcessError::NoStoredFile(scan.id))?;
        let bytes = self.recorder.storage().read(storage_path).await?;
        let fingerprint = Fingerprint::of(&bytes);
        self.recorder
            .index()
            .set_fingerprint(scan.id, &fingerprint.content_hash, fingerprint.byte_len)?;

        if fingerprint.is_empty() {
            self.recorder.complete_without_analysis(scan, "empty file").await?;
            return Ok(ScanOutcome::Empty);
        }
        if let Some(previous) =
            self.detector
                .unchanged_since(&scan.site_url, &scan.file_path, &fingerprint)?
        {
            self.recorder.complete_unchanged(scan, &previous)?;
            return Ok(ScanOutcome::Unchanged {
                previous_scan: previous.id,
            });
        }
        let kind = FileKind::classify(&scan.file_type);
        let analyzable = kind.is_text() && (kind != FileKind::Other || is_analyzable_path(&scan.file_path));
        if !analyzable {
            self.recorder
                .complete_without_analysis(scan, "unsupported file type")
                .await?;
            return Ok(ScanOutcome::NotAnalyzable);
        }

        let content = String::from_utf8_lossy(&bytes);
        let analysis = self
            .pipeline
            .analyze(&scan.file_path, &scan.file_type, &content, cancel)
            .await?;
        let issues = analysis.issues.len() as u64;
        self.recorder.persist_result(scan, analysis).await?;
        Ok(ScanOutcome::Analyzed { issues })
    }
}
