//! Persistence layer: scans, suggestions and upload sessions in SQLite.

pub mod index;
pub mod schema;
mod sessions;
pub mod status;

pub use index::{now_timestamp, timestamp_ago, ScanIndex, StoreError, StoreResult};
pub use schema::{
    FileScan, FileSuggestion, FileUpload, FileUploadChunk, NewScan, ScanWithSuggestion,
    SuggestionWrite,
};
pub use sessions::NewUpload;
pub use status::{ScanStatus, SuggestionStatus, TransitionError, UploadStatus};
