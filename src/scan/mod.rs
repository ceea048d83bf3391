//! Scan lifecycle: change detection, processing, the work queue and
//! housekeeping.

pub mod change;
pub mod directory;
pub mod processor;
pub mod queue;
pub mod recorder;
pub mod retention;

pub use change::{ChangeDetector, Fingerprint};
pub use directory::{DirectoryReport, DirectoryScanner};
pub use processor::{ProcessError, ScanOutcome, ScanProcessor};
pub use queue::{Job, QueueError, ScanQueue};
pub use recorder::{bundle_path, ScanRecorder, SuggestionBundle};
pub use retention::{CleanupReport, Retention};
