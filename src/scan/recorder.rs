//! FileScan / FileSuggestion lifecycle and suggestion bundle files.

use crate::analysis::{Documentation, FileAnalysis, Issue};
use crate::metrics::Metrics;
use crate::store::{
    FileScan, NewScan, ScanIndex, ScanStatus, StoreResult, SuggestionStatus,
    SuggestionWrite,
};
use crate::uploads::BlobStorage;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The JSON document written next to the analyzed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionBundle {
    pub id: String,
    pub file: String,
    pub full_path: String,
    pub issues: Vec<Issue>,
    pub documentation: Documentation,
}

/// `{dir}/suggestions/{stem}_suggestions.json` beside the stored file.
pub fn bundle_path(scan: &FileScan) -> String {
    let source = scan.storage_path.as_deref().unwrap_or(&scan.file_path);
    let path = Path::new(source);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("scan_{}", scan.id));
    match path.parent().map(|p| p.to_string_lossy()) {
        Some(dir) if !dir.is_empty() => format!("{dir}/suggestions/{stem}_suggestions.json"),
        _ => format!("suggestions/{stem}_suggestions.json"),
    }
}

fn file_name(scan: &FileScan) -> String {
    Path::new(&scan.file_path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| scan.file_path.clone())
}

pub struct ScanRecorder {
    index: Arc<ScanIndex>,
    storage: Arc<BlobStorage>,
    metrics: Metrics,
}

impl ScanRecorder {
    pub fn new(index: Arc<ScanIndex>, storage: Arc<BlobStorage>, metrics: Metrics) -> Self {
        Self {
            index,
            storage,
            metrics,
        }
    }

    pub fn index(&self) -> &Arc<ScanIndex> {
        &self.index
    }

    /// Record a freshly stored file as a pending scan.
    pub fn record_upload(&self, scan: &NewScan) -> StoreResult<FileScan> {
        let created = self.index.insert_scan(scan, ScanStatus::Pending)?;
        info!(
            scan_id = created.id,
            file = %created.file_path,
            site = %created.site_url,
            "Scan recorded"
        );
        Ok(created)
    }

    /// `pending|queued|failed -> processing`, with the suggestion following.
    pub fn start(&self, scan: &FileScan) -> StoreResult<FileScan> {
        let started = self.index.transition_scan(scan.id, ScanStatus::Processing)?;
        self.index.upsert_suggestion(&SuggestionWrite {
            file_scan_id: scan.id,
            file_path: scan.file_path.clone(),
            suggestion: String::new(),
            status: SuggestionStatus::Processing,
            ai_model: None,
            token_count: None,
            metadata: json!({}),
            error: None,
        })?;
        Ok(started)
    }

    async fn write_bundle(&self, scan: &FileScan, bundle: &SuggestionBundle) -> Result<String> {
        let rel = bundle_path(scan);
        let body = serde_json::to_vec_pretty(bundle)?;
        self.storage
            .put(&rel, &body)
            .await
            .with_context(|| format!("Failed to write suggestion bundle for scan {}", scan.id))?;
        Ok(rel)
    }

    fn bundle_for(scan: &FileScan, issues: Vec<Issue>, documentation: Documentation) -> SuggestionBundle {
        let stem = Path::new(&scan.file_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        SuggestionBundle {
            id: format!("{stem}-analysis-{}", Utc::now().timestamp()),
            file: file_name(scan),
            full_path: scan.file_path.clone(),
            issues,
            documentation,
        }
    }

    /// Persist a finished analysis: bundle file, processed suggestion, and
    /// finally the `completed` mark.
    pub async fn persist_result(&self, scan: &FileScan, analysis: FileAnalysis) -> Result<FileScan> {
        let issues_count = analysis.issues.len() as u64;
        let bundle = Self::bundle_for(scan, analysis.issues, analysis.documentation);
        let bundle_file = self.write_bundle(scan, &bundle).await?;
        let metadata = json!({
            "suggestion_file_path": bundle_file,
            "issues_count": issues_count,
            "chunk_count": analysis.chunk_count,
            "failed_chunks": analysis.failed_chunks,
        });
        self.index.upsert_suggestion(&SuggestionWrite {
            file_scan_id: scan.id,
            file_path: scan.file_path.clone(),
            suggestion: serde_json::to_string(&bundle)?,
            status: SuggestionStatus::Processed,
            ai_model: Some(analysis.model),
            token_count: Some(analysis.token_count),
            metadata,
            error: None,
        })?;
        let completed = self.index.complete_scan(scan.id, issues_count)?;
        self.metrics.issues_recorded.inc_by(issues_count);
        self.metrics
            .scans_finished
            .with_label_values(&[ScanStatus::Completed.as_str()])
            .inc();
        info!(scan_id = scan.id, issues = issues_count, "Scan completed");
        Ok(completed)
    }

    /// Complete a scan without analysis: empty files and files the analyzer
    /// does not handle. The bundle carries no issues.
    pub async fn complete_without_analysis(&self, scan: &FileScan, reason: &str) -> Result<FileScan> {
        let bundle = Self::bundle_for(scan, Vec::new(), Documentation::clean());
        let bundle_file = self.write_bundle(scan, &bundle).await?;
        self.index.upsert_suggestion(&SuggestionWrite {
            file_scan_id: scan.id,
            file_path: scan.file_path.clone(),
            suggestion: serde_json::to_string(&bundle)?,
            status: SuggestionStatus::Processed,
            ai_model: None,
            token_count: Some(0),
            metadata: json!({
                "suggestion_file_path": bundle_file,
                "issues_count": 0,
                "skipped": reason,
            }),
            error: None,
        })?;
        let completed = self.index.complete_scan(scan.id, 0)?;
        self.metrics
            .scans_finished
            .with_label_values(&[ScanStatus::Completed.as_str()])
            .inc();
        info!(scan_id = scan.id, reason, "Scan completed without analysis");
        Ok(completed)
    }

    /// Complete a scan whose content matches an earlier completed scan; the
    /// suggestion points back at that scan.
    pub fn complete_unchanged(&self, scan: &FileScan, previous: &FileScan) -> StoreResult<FileScan> {
        let prior = self.index.suggestion_for_scan(previous.id)?;
        let issues_found = previous.issues_found.unwrap_or(0);
        self.index.upsert_suggestion(&SuggestionWrite {
            file_scan_id: scan.id,
            file_path: scan.file_path.clone(),
            suggestion: prior.as_ref().map(|s| s.suggestion.clone()).unwrap_or_default(),
            status: SuggestionStatus::Processed,
            ai_model: prior.as_ref().and_then(|s| s.ai_model.clone()),
            token_count: Some(0),
            metadata: json!({
                "unchanged_since_scan": previous.id,
                "issues_count": issues_found,
                "suggestion_file_path": prior
                    .as_ref()
                    .and_then(|s| s.metadata.get("suggestion_file_path").cloned()),
            }),
            error: None,
        })?;
        let completed = self.index.complete_scan(scan.id, issues_found)?;
        self.metrics
            .scans_finished
            .with_label_values(&[ScanStatus::Completed.as_str()])
            .inc();
        info!(scan_id = scan.id, previous_scan = previous.id, "File unchanged; reusing result");
        Ok(completed)
    }

    /// Mark a scan failed. The record is re-fetched first; completed or
    /// archived scans are left alone, and marking twice is harmless.
    pub fn mark_failed(&self, scan_id: i64, reason: &str) -> StoreResult<Option<FileScan>> {
        let Some(current) = self.index.get_scan(scan_id)? else {
            warn!(scan_id, "Cannot mark missing scan as failed");
            return Ok(None);
        };
        if current.status.transition(ScanStatus::Failed).is_err() {
            warn!(scan_id, status = %current.status, "Scan not marked failed");
            return Ok(Some(current));
        }
        let existing = self.index.suggestion_for_scan(scan_id)?;
        if existing.as_ref().is_none_or(|s| s.status != SuggestionStatus::Processed) {
            self.index.upsert_suggestion(&SuggestionWrite {
                file_scan_id: scan_id,
                file_path: current.file_path.clone(),
                suggestion: existing.as_ref().map(|s| s.suggestion.clone()).unwrap_or_default(),
                status: SuggestionStatus::Failed,
                ai_model: existing.as_ref().and_then(|s| s.ai_model.clone()),
                token_count: existing.as_ref().and_then(|s| s.token_count),
                metadata: existing.map(|s| s.metadata).unwrap_or_else(|| json!({})),
                error: Some(reason.to_string()),
            })?;
        }
        let failed = self.index.transition_scan(scan_id, ScanStatus::Failed)?;
        if current.status != ScanStatus::Failed {
            self.metrics
                .scans_finished
                .with_label_values(&[ScanStatus::Failed.as_str()])
                .inc();
        }
        error!(scan_id, reason, "Scan failed");
        Ok(Some(failed))
    }

    /// Bump the suggestion retry counter, creating a pending suggestion when
    /// the scan never got one.
    pub fn bump_retry(&self, scan: &FileScan) -> StoreResult<u32> {
        if self.index.suggestion_for_scan(scan.id)?.is_none() {
            self.index.upsert_suggestion(&SuggestionWrite {
                file_scan_id: scan.id,
                file_path: scan.file_path.clone(),
                suggestion: String::new(),
                status: SuggestionStatus::Pending,
                ai_model: None,
                token_count: None,
                metadata: json!({}),
                error: None,
            })?;
        }
        self.index.increment_suggestion_retry(scan.id)
    }

    /// Remove the bundle file referenced by a scan's suggestion.
    pub async fn delete_bundle(&self, scan_id: i64) -> Result<bool> {
        let Some(suggestion) = self.index.suggestion_for_scan(scan_id)? else {
            return Ok(false);
        };
        let Some(path) = suggestion
            .metadata
            .get("suggestion_file_path")
            .and_then(|v| v.as_str())
        else {
            return Ok(false);
        };
        // Unchanged scans share the bundle of an earlier scan.
        if suggestion.metadata.get("unchanged_since_scan").is_some() {
            return Ok(false);
        }
        self.storage.delete(path).await?;
        Ok(true)
    }

    pub fn storage(&self) -> &Arc<BlobStorage> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::issues::{ApplyMethod, AutoFixable, Location, Severity};
    use tempfile::TempDir;

    fn recorder(tmp: &TempDir) -> ScanRecorder {
        ScanRecorder::new(
            Arc::new(ScanIndex::open_in_memory().unwrap()),
            Arc::new(BlobStorage::from_path(tmp.path().to_path_buf())),
            Metrics::new().unwrap(),
        )
    }

    fn new_scan() -> NewScan {
        NewScan {
            site_url: "https://example.com".into(),
            theme: "demo".into(),
            file_path: "inc/helpers.php".into(),
            file_type: "php".into(),
            storage_path: Some("wordpress/php/example-com/20260101_000000_abc_inc_helpers.php".into()),
            ..Default::default()
        }
    }

    fn analysis(issues: Vec<Issue>) -> FileAnalysis {
        FileAnalysis {
            documentation: if issues.is_empty() {
                Documentation::clean()
            } else {
                Documentation::fallback()
            },
            issues,
            chunk_count: 1,
            failed_chunks: 0,
            token_count: 12,
            model: "scripted".into(),
        }
    }

    #[test]
    fn bundle_lives_beside_the_stored_file() {
        let rec = recorder(&TempDir::new().unwrap());
        let scan = rec.record_upload(&new_scan()).unwrap();
        assert_eq!(
            bundle_path(&scan),
            "wordpress/php/example-com/suggestions/20260101_000000_abc_inc_helpers_suggestions.json"
        );
    }

    #[tokio::test]
    async fn zero_issue_result_completes_with_empty_bundle() {
        let tmp = TempDir::new().unwrap();
        let rec = recorder(&tmp);
        let scan = rec.record_upload(&new_scan()).unwrap();
        let scan = rec.start(&scan).unwrap();
        let done = rec.persist_result(&scan, analysis(vec![])).await.unwrap();
        assert_eq!(done.status, ScanStatus::Completed);
        assert_eq!(done.issues_found, Some(0));

        let suggestion = rec.index().suggestion_for_scan(scan.id).unwrap().unwrap();
        assert_eq!(suggestion.status, SuggestionStatus::Processed);
        assert_eq!(suggestion.metadata["issues_count"], 0);
        let file = rec.storage().read(&bundle_path(&scan)).await.unwrap();
        let bundle: SuggestionBundle = serde_json::from_slice(&file).unwrap();
        assert!(bundle.issues.is_empty());
        assert_eq!(bundle.file, "helpers.php");
        assert!(bundle.id.starts_with("helpers-analysis-"));
        assert_eq!(bundle.documentation, Documentation::clean());
    }

    #[tokio::test]
    async fn bundle_serializes_issue_locations() {
        let tmp = TempDir::new().unwrap();
        let rec = recorder(&tmp);
        let scan = rec.start(&rec.record_upload(&new_scan()).unwrap()).unwrap();
        let issue = Issue {
            location: Location::Range(12, 14),
            original_code_snippet: "$wpdb->query($sql);".into(),
            issue: "Unprepared query".into(),
            severity: Severity::Critical,
            fix_suggestion: "$wpdb->prepare(...)".into(),
            auto_fixable: AutoFixable::Semi,
            apply_method: ApplyMethod::ReplaceLines,
        };
        rec.persist_result(&scan, analysis(vec![issue])).await.unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&rec.storage().read(&bundle_path(&scan)).await.unwrap()).unwrap();
        assert_eq!(raw["issues"][0]["location"], "12-14");
        assert_eq!(raw["issues"][0]["severity"], "Critical");
        assert!(raw["issues"][0].get("relative_line").is_none());
    }

    #[test]
    fn mark_failed_is_idempotent_and_spares_completed_scans() {
        let rec = recorder(&TempDir::new().unwrap());
        let scan = rec.start(&rec.record_upload(&new_scan()).unwrap()).unwrap();
        let failed = rec.mark_failed(scan.id, "analyzer unreachable").unwrap().unwrap();
        assert_eq!(failed.status, ScanStatus::Failed);
        let again = rec.mark_failed(scan.id, "analyzer unreachable").unwrap().unwrap();
        assert_eq!(again.status, ScanStatus::Failed);
        let suggestion = rec.index().suggestion_for_scan(scan.id).unwrap().unwrap();
        assert_eq!(suggestion.status, SuggestionStatus::Failed);
        assert_eq!(suggestion.error.as_deref(), Some("analyzer unreachable"));

        let other = rec.record_upload(&new_scan()).unwrap();
        rec.index().complete_scan(other.id, 0).unwrap();
        let kept = rec.mark_failed(other.id, "late failure").unwrap().unwrap();
        assert_eq!(kept.status, ScanStatus::Completed);
        assert!(rec.mark_failed(9999, "gone").unwrap().is_none());
    }

    #[test]
    fn bump_retry_creates_missing_suggestion() {
        let rec = recorder(&TempDir::new().unwrap());
        let scan = rec.record_upload(&new_scan()).unwrap();
        assert_eq!(rec.bump_retry(&scan).unwrap(), 1);
        assert_eq!(rec.bump_retry(&scan).unwrap(), 2);
    }
}
