use crate::store::{FileScan, ScanIndex, StoreResult};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Whole-file content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub byte_len: u64,
}

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            content_hash: hex::encode(Sha256::digest(bytes)),
            byte_len: bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len == 0
    }
}

/// Decides whether a file needs analysis by comparing it to the latest
/// completed scan of the same (site_url, file_path).
pub struct ChangeDetector {
    index: Arc<ScanIndex>,
}

impl ChangeDetector {
    pub fn new(index: Arc<ScanIndex>) -> Self {
        Self { index }
    }

    /// The completed scan that makes this content redundant, if any.
    pub fn unchanged_since(
        &self,
        site_url: &str,
        file_path: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<Option<FileScan>> {
        let Some(previous) = self.index.latest_completed(site_url, file_path)? else {
            return Ok(None);
        };
        let same = previous.content_hash.as_deref() == Some(fingerprint.content_hash.as_str());
        debug!(
            file = file_path,
            previous_scan = previous.id,
            unchanged = same,
            "Compared against last completed scan"
        );
        Ok(same.then_some(previous))
    }

    pub fn should_skip(
        &self,
        site_url: &str,
        file_path: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<bool> {
        Ok(self
            .unchanged_since(site_url, file_path, fingerprint)?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewScan, ScanStatus};

    const SITE: &str = "https://example.com";

    fn record(index: &ScanIndex, bytes: &[u8], status: ScanStatus) -> FileScan {
        let fp = Fingerprint::of(bytes);
        let scan = index
            .insert_scan(
                &NewScan {
                    site_url: SITE.into(),
                    file_path: "style.css".into(),
                    file_type: "css".into(),
                    content_hash: Some(fp.content_hash),
                    byte_len: Some(fp.byte_len),
                    ..Default::default()
                },
                ScanStatus::Pending,
            )
            .unwrap();
        if status == ScanStatus::Completed {
            index.complete_scan(scan.id, 0).unwrap()
        } else {
            index.transition_scan(scan.id, status).unwrap()
        }
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        let fp = Fingerprint::of(b"abc");
        assert_eq!(
            fp.content_hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fp.byte_len, 3);
        assert!(Fingerprint::of(b"").is_empty());
    }

    #[test]
    fn skips_only_identical_completed_content() {
        let index = Arc::new(ScanIndex::open_in_memory().unwrap());
        let detector = ChangeDetector::new(index.clone());
        let body = b"a { color: red; }";
        assert!(!detector.should_skip(SITE, "style.css", &Fingerprint::of(body)).unwrap());

        record(&index, body, ScanStatus::Completed);
        assert!(detector.should_skip(SITE, "style.css", &Fingerprint::of(body)).unwrap());
        assert!(!detector
            .should_skip(SITE, "style.css", &Fingerprint::of(b"a { color: blue; }"))
            .unwrap());
        assert!(!detector
            .should_skip("https://other.test", "style.css", &Fingerprint::of(body))
            .unwrap());
    }

    #[test]
    fn non_completed_scans_do_not_count() {
        let index = Arc::new(ScanIndex::open_in_memory().unwrap());
        let detector = ChangeDetector::new(index.clone());
        let body = b"a{}";
        record(&index, body, ScanStatus::Failed);
        record(&index, body, ScanStatus::Processing);
        assert!(!detector.should_skip(SITE, "style.css", &Fingerprint::of(body)).unwrap());
    }
}
