//! Transfer request, status and record types

use crate::bucket::BucketId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type TransferId = String;

/// What the caller wants uploaded.
#[derive(Debug, Clone)]
pub enum TransferSource {
    /// A single local file; uploaded under its own file name
    File(PathBuf),
    /// A directory, expanded recursively into one transfer per file
    Folder(PathBuf),
    /// Clipboard text
    Text { content: String, filename: String },
    /// Clipboard image bytes
    Image { bytes: Bytes, filename: String },
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: TransferSource,
    pub bucket_id: BucketId,
    /// Remote prefix; joined with the file name (or relative path) using `/`
    pub remote_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Waiting,
    Uploading {
        progress: f64,
        #[serde(rename = "bytesUploaded")]
        bytes_uploaded: u64,
        #[serde(rename = "totalBytes")]
        total_bytes: u64,
        /// Bytes per second over a trailing window
        speed: f64,
    },
    Success,
    Cancelled,
    Error {
        message: String,
        code: String,
    },
}

impl TransferStatus {
    /// Builds an `Uploading` status with `progress` derived from the byte
    /// counts. `bytes_uploaded` is clamped to `total_bytes`.
    pub fn uploading(bytes_uploaded: u64, total_bytes: u64, speed: f64) -> Self {
        let bytes_uploaded = bytes_uploaded.min(total_bytes);
        let progress = if total_bytes == 0 {
            1.0
        } else {
            bytes_uploaded as f64 / total_bytes as f64
        };
        TransferStatus::Uploading {
            progress,
            bytes_uploaded,
            total_bytes,
            speed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Success | TransferStatus::Cancelled | TransferStatus::Error { .. }
        )
    }

    pub fn bytes_uploaded(&self) -> Option<u64> {
        match self {
            TransferStatus::Uploading { bytes_uploaded, .. } => Some(*bytes_uploaded),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Waiting => write!(f, "waiting"),
            TransferStatus::Uploading { .. } => write!(f, "uploading"),
            TransferStatus::Success => write!(f, "success"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
            TransferStatus::Error { .. } => write!(f, "error"),
        }
    }
}

/// Registry entry for one transfer, also the payload of progress events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: TransferId,
    pub bucket_id: BucketId,
    pub filename: String,
    pub key: String,
    pub status: TransferStatus,
    /// Shareable URL, set once the upload succeeds
    pub url: Option<String>,
    /// Unix seconds
    pub submitted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferFilter {
    #[default]
    All,
    InProgress,
    Completed,
}

impl TransferFilter {
    pub fn matches(&self, status: &TransferStatus) -> bool {
        match self {
            TransferFilter::All => true,
            TransferFilter::InProgress => !status.is_terminal(),
            TransferFilter::Completed => status.is_terminal(),
        }
    }
}

/// One page of the transfer registry, newest submissions last.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPage {
    pub items: Vec<TransferRecord>,
    /// Matching records across all pages
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_like_progress_events() {
        let json = serde_json::to_value(TransferStatus::uploading(5, 10, 2.5)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "uploading": {"progress": 0.5, "bytesUploaded": 5, "totalBytes": 10, "speed": 2.5}
            })
        );
        assert_eq!(serde_json::to_value(TransferStatus::Success).unwrap(), "success");
        assert_eq!(serde_json::to_value(TransferStatus::Waiting).unwrap(), "waiting");
    }

    #[test]
    fn uploading_clamps_to_total() {
        let status = TransferStatus::uploading(20, 10, 0.0);
        assert_eq!(status.bytes_uploaded(), Some(10));
        assert_eq!(TransferStatus::uploading(0, 0, 0.0), TransferStatus::Uploading {
            progress: 1.0,
            bytes_uploaded: 0,
            total_bytes: 0,
            speed: 0.0,
        });
    }

    #[test]
    fn filters_split_on_terminal_state() {
        let error = TransferStatus::Error {
            message: "denied".to_string(),
            code: "AccessDenied".to_string(),
        };
        assert!(TransferFilter::Completed.matches(&error));
        assert!(!TransferFilter::InProgress.matches(&error));
        assert!(TransferFilter::InProgress.matches(&TransferStatus::Waiting));
        assert!(TransferFilter::All.matches(&TransferStatus::Cancelled));
    }
}
