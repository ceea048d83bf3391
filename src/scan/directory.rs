//! Walk of the stored `wordpress/` tree: every supported file not seen
//! before (or changed since its last completed scan) is analyzed.

use super::change::{ChangeDetector, Fingerprint};
use super::processor::ScanProcessor;
use crate::store::NewScan;
use crate::uploads::kind::{is_analyzable_path, FileKind};
use crate::uploads::naming::site_folder_name;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Component, Path};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TREE_ROOT: &str = "wordpress";

#[derive(Debug, Default, Clone, Serialize)]
pub struct DirectoryReport {
    pub processed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// A stored file, located relative to the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// `wordpress/{kind}/{site}/{rest}`
    pub storage_path: String,
    pub site_folder: String,
    /// `{rest}`: the path within the site folder.
    pub file_path: String,
    pub file_type: String,
}

fn is_hidden_or_generated(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part.starts_with('.') || part == "suggestions"
        }
        _ => false,
    })
}

/// Parse `wordpress/{kind}/{site}/{rest...}` into a tree entry.
pub fn tree_entry(rel: &Path) -> Option<TreeEntry> {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let [root, _kind, site, rest @ ..] = parts.as_slice() else {
        return None;
    };
    if root != TREE_ROOT || rest.is_empty() {
        return None;
    }
    let file_path = rest.join("/");
    let file_type = Path::new(&file_path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    Some(TreeEntry {
        storage_path: parts.join("/"),
        site_folder: site.clone(),
        file_path,
        file_type,
    })
}

/// Every analyzable file under the tree, optionally limited to one site
/// folder. Sorted for a stable processing order.
pub fn collect_entries(base_dir: &Path, site_folder: Option<&str>) -> Result<Vec<TreeEntry>> {
    let pattern = format!(
        "{}/{TREE_ROOT}/**/*",
        glob::Pattern::escape(&base_dir.to_string_lossy())
    );
    let mut entries = Vec::new();
    for path in glob::glob(&pattern).context("Invalid storage glob")? {
        let path = match path {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping unreadable path: {e}");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(base_dir) else {
            continue;
        };
        if is_hidden_or_generated(rel) || !is_analyzable_path(&rel.to_string_lossy()) {
            continue;
        }
        let Some(entry) = tree_entry(rel) else {
            continue;
        };
        if site_folder.is_some_and(|s| s != entry.site_folder) {
            continue;
        }
        entries.push(entry);
    }
    entries.sort_by(|a, b| a.storage_path.cmp(&b.storage_path));
    Ok(entries)
}

pub struct DirectoryScanner {
    processor: Arc<ScanProcessor>,
    detector: ChangeDetector,
}

impl DirectoryScanner {
    pub fn new(processor: Arc<ScanProcessor>) -> Self {
        Self {
            detector: ChangeDetector::new(processor.recorder().index().clone()),
            processor,
        }
    }

    /// Scan the tree. With `site_url`, only that site's folder is walked and
    /// scans are recorded under that URL; otherwise the folder name stands in.
    pub async fn scan(
        &self,
        site_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<DirectoryReport> {
        let storage = self.processor.recorder().storage();
        let folder = site_url.map(site_folder_name);
        let entries = collect_entries(storage.base_dir(), folder.as_deref())?;
        info!(files = entries.len(), "Directory scan started");

        let mut report = DirectoryReport::default();
        for entry in entries {
            if cancel.is_cancelled() {
                warn!("Directory scan cancelled");
                break;
            }
            let site = site_url.unwrap_or(&entry.site_folder);
            match self.scan_entry(site, &entry, cancel).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(file = %entry.storage_path, "Directory scan error: {e:#}");
                    report.errors.push(format!("{}: {e:#}", entry.storage_path));
                }
            }
        }
        info!(
            processed = report.processed,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Directory scan finished"
        );
        Ok(report)
    }

    /// Returns false when the file was skipped as unchanged.
    async fn scan_entry(
        &self,
        site_url: &str,
        entry: &TreeEntry,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let recorder = self.processor.recorder();
        let bytes = recorder.storage().read(&entry.storage_path).await?;
        let fingerprint = Fingerprint::of(&bytes);
        if self
            .detector
            .should_skip(site_url, &entry.file_path, &fingerprint)?
        {
            return Ok(false);
        }
        let kind = FileKind::classify(&entry.file_type);
        let scan = recorder.record_upload(&NewScan {
            site_url: site_url.to_string(),
            theme: String::new(),
            file_path: entry.file_path.clone(),
            file_type: if kind == FileKind::Other {
                entry.file_type.clone()
            } else {
                kind.storage_dir().to_string()
            },
            storage_path: Some(entry.storage_path.clone()),
            content_hash: Some(fingerprint.content_hash),
            byte_len: Some(fingerprint.byte_len),
        })?;
        self.processor.process(scan.id, cancel).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyzer::fake::ScriptedAnalyzer;
    use crate::scan::processor::tests::processor;
    use tempfile::TempDir;

    #[test]
    fn tree_entries_split_site_and_path() {
        let entry = tree_entry(Path::new("wordpress/php/example-com/inc/a.php")).unwrap();
        assert_eq!(entry.site_folder, "example-com");
        assert_eq!(entry.file_path, "inc/a.php");
        assert_eq!(entry.file_type, "php");
        assert!(tree_entry(Path::new("wordpress/php/a.php")).is_none());
        assert!(tree_entry(Path::new("temp/chunk_uploads/x/chunk_0")).is_none());
    }

    #[tokio::test]
    async fn walk_skips_hidden_generated_and_unsupported() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("wordpress/php/example-com");
        std::fs::create_dir_all(root.join("suggestions")).unwrap();
        std::fs::write(root.join("a.php"), "<?php echo 1;").unwrap();
        std::fs::write(root.join(".hidden.php"), "<?php").unwrap();
        std::fs::write(root.join("suggestions/a_suggestions.json"), "{}").unwrap();
        std::fs::write(root.join("logo.exe"), "MZ").unwrap();
        let other = tmp.path().join("wordpress/css/other-site");
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(other.join("style.css"), "a{}").unwrap();

        let all = collect_entries(tmp.path(), None).unwrap();
        let paths: Vec<_> = all.iter().map(|e| e.storage_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["wordpress/css/other-site/style.css", "wordpress/php/example-com/a.php"]
        );
        let one = collect_entries(tmp.path(), Some("example-com")).unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn second_scan_skips_unchanged_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("wordpress/php/example-com");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.php"), "<?php echo 1;").unwrap();
        std::fs::write(root.join("b.php"), "<?php echo 2;").unwrap();

        let scanner = DirectoryScanner::new(Arc::new(processor(&tmp, ScriptedAnalyzer::new(vec![]))));
        let cancel = CancellationToken::new();
        let first = scanner.scan(Some("https://example.com"), &cancel).await.unwrap();
        assert_eq!((first.processed, first.skipped), (2, 0));
        assert!(first.errors.is_empty());

        std::fs::write(root.join("b.php"), "<?php echo 3;").unwrap();
        let second = scanner.scan(Some("https://example.com"), &cancel).await.unwrap();
        assert_eq!((second.processed, second.skipped), (1, 1));
    }
}
