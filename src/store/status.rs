//! Status state machines for uploads, scans and suggestions.
//!
//! Each entity has exactly one transition function; persisted strings are
//! converted through `FromStr`/`as_str` at the database boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal {entity} transition: {from} -> {to}")]
    Illegal {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("unknown {entity} status: {value}")]
    Unknown { entity: &'static str, value: String },
}

/// Lifecycle of a chunked upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Receiving,
    Finalizing,
    Completed,
    Failed,
    Aborted,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Receiving => "receiving",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Chunks may only land while the session is receiving.
    pub fn accepts_chunks(self) -> bool {
        self == Self::Receiving
    }

    pub fn transition(self, to: Self) -> Result<Self, TransitionError> {
        use UploadStatus::*;
        let allowed = matches!(
            (self, to),
            (Pending, Receiving)
                | (Pending, Aborted)
                | (Receiving, Finalizing)
                | (Receiving, Aborted)
                | (Finalizing, Completed)
                | (Finalizing, Receiving)
                | (Finalizing, Failed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(TransitionError::Illegal {
                entity: "upload",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

impl FromStr for UploadStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            // legacy rows wrote "processing" while chunks were arriving
            "receiving" | "processing" => Ok(Self::Receiving),
            "finalizing" => Ok(Self::Finalizing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(TransitionError::Unknown {
                entity: "upload",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one file scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Archived,
}

impl ScanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    /// Human readable status line for the status endpoints.
    pub fn message(self) -> &'static str {
        match self {
            Self::Pending => "File scan is pending and will be processed soon.",
            Self::Queued => "File scan is queued for processing.",
            Self::Processing => "File scan is currently being processed.",
            Self::Completed => "File scan has been successfully completed.",
            Self::Failed => "File scan encountered an error during processing.",
            Self::Archived => "File scan has been archived.",
        }
    }

    /// Queued or processing: a worker owns the scan.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    /// Whether the retry/batch endpoints may put this scan back on the queue.
    pub fn can_enqueue(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    pub fn transition(self, to: Self) -> Result<Self, TransitionError> {
        use ScanStatus::*;
        let allowed = matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Archived)
                | (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued)
                | (Failed, Queued)
                | (Failed, Processing)
                | (Failed, Failed)
                | (Failed, Archived)
                | (Completed, Archived)
        );
        if allowed {
            Ok(to)
        } else {
            Err(TransitionError::Illegal {
                entity: "scan",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

impl FromStr for ScanStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" | "processed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "archived" => Ok(Self::Archived),
            other => Err(TransitionError::Unknown {
                entity: "scan",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl SuggestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn transition(self, to: Self) -> Result<Self, TransitionError> {
        use SuggestionStatus::*;
        let allowed = matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Processed)
                | (Pending, Failed)
                | (Processing, Processed)
                | (Processing, Failed)
                | (Failed, Processing)
                | (Processed, Processing)
        );
        if allowed {
            Ok(to)
        } else {
            Err(TransitionError::Illegal {
                entity: "suggestion",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

impl FromStr for SuggestionStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(TransitionError::Unknown {
                entity: "suggestion",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
