//! OSS XML request and response bodies

use crate::error::{StorageError, StorageResult};
use crate::providers::CompletedPart;
use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ListBucketResult {
    #[serde(default)]
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    #[serde(default)]
    pub contents: Vec<ObjectContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ObjectContent {
    pub key: String,
    #[serde(default)]
    pub last_modified: String,
    #[serde(rename = "ETag", default)]
    pub etag: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ListMultipartUploadsResult {
    #[serde(default)]
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
    #[serde(default)]
    pub upload: Vec<UploadEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct UploadEntry {
    pub key: String,
    pub upload_id: String,
    #[serde(default)]
    pub initiated: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct InitiateMultipartUploadResult {
    pub upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct ErrorResponse {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: Vec<PartEntry<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PartEntry<'a> {
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

pub(super) fn completion_body(parts: &[CompletedPart]) -> StorageResult<String> {
    let body = CompleteMultipartUpload {
        parts: parts
            .iter()
            .map(|p| PartEntry {
                part_number: p.part_number,
                etag: &p.etag,
            })
            .collect(),
    };
    quick_xml::se::to_string(&body)
        .map_err(|e| StorageError::Validation(format!("failed to encode completion body: {}", e)))
}

pub(super) fn parse<T: DeserializeOwned>(operation: &str, xml: &str) -> StorageResult<T> {
    quick_xml::de::from_str(xml).map_err(|e| {
        StorageError::provider(
            "MalformedResponse",
            format!("{}: failed to parse XML response: {}", operation, e),
            None,
        )
    })
}

/// OSS timestamps are ISO 8601 with milliseconds, e.g. `2024-01-02T03:04:05.000Z`.
pub(super) fn unix_seconds(timestamp: &str) -> i64 {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.timestamp())
        .unwrap_or_default()
}
