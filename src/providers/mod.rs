//! Provider adapters - one capability set over R2, S3-compatible and OSS
//!
//! This module is organized into submodules:
//! - `signing`: SigV4 / OSS V4 signatures and presigned URLs
//! - `s3_client`: aws-sdk client construction and the S3-style adapter
//! - `r2`: Cloudflare R2 connection setup
//! - `s3`: generic S3-compatible connection setup
//! - `oss`: Aliyun OSS adapter over signed HTTP requests

mod oss;
mod r2;
mod s3;
mod s3_client;
pub mod signing;

use crate::bucket::{resolve_target, Bucket, BucketTarget, ProviderKind};
use crate::config::{AppSettings, EngineConfig};
use crate::error::{ConfigError, StorageError, StorageResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use oss::OssAdapter;
pub use s3_client::S3CompatAdapter;

/// Highest part number any supported provider accepts.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Listing page size ceiling shared by S3 and OSS.
pub const MAX_LIST_PAGE_SIZE: u32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    /// Unix seconds
    pub last_modified: i64,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartUploadHandle {
    pub key: String,
    pub upload_id: String,
    /// Unix seconds
    pub initiated: i64,
}

/// One page of a listing. A page that is not truncated never carries a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPage<T> {
    pub items: Vec<T>,
    pub is_truncated: bool,
    pub continuation_token: Option<String>,
}

impl<T> ListingPage<T> {
    pub fn new(items: Vec<T>, is_truncated: bool, continuation_token: Option<String>) -> Self {
        let continuation_token = continuation_token.filter(|t| is_truncated && !t.is_empty());
        Self {
            items,
            is_truncated: continuation_token.is_some(),
            continuation_token,
        }
    }

    pub fn map_token(self, f: impl FnOnce(String) -> String) -> Self {
        Self {
            items: self.items,
            is_truncated: self.is_truncated,
            continuation_token: self.continuation_token.map(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Payload for a single-shot put.
#[derive(Debug, Clone)]
pub enum ObjectBody {
    Bytes(Bytes),
    File { path: PathBuf, len: u64 },
}

impl ObjectBody {
    pub fn len(&self) -> u64 {
        match self {
            ObjectBody::Bytes(bytes) => bytes.len() as u64,
            ObjectBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The operations every storage backend exposes to the engine.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn bucket_name(&self) -> &str;

    /// Cheap authenticated round-trip used to validate a configuration
    async fn ping(&self) -> StorageResult<()>;

    async fn put_object(&self, key: &str, body: ObjectBody, content_type: &str) -> StorageResult<()>;

    async fn initiate_multipart(&self, key: &str, content_type: &str) -> StorageResult<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<CompletedPart>;

    /// `parts` must be strictly ascending by part number.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    async fn list_objects(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        page_size: u32,
    ) -> StorageResult<ListingPage<RemoteObject>>;

    async fn list_multipart_uploads(
        &self,
        continuation_token: Option<&str>,
        page_size: u32,
    ) -> StorageResult<ListingPage<MultipartUploadHandle>>;

    async fn delete_object(&self, key: &str) -> StorageResult<()>;

    /// Computed locally; fails with `Signing` for malformed credentials.
    fn presigned_url(&self, key: &str, ttl_secs: u64) -> StorageResult<String>;
}

/// Reject a completion request the provider would refuse: empty, out of
/// order, duplicated or out of range part numbers.
pub fn validate_completion(parts: &[CompletedPart]) -> StorageResult<()> {
    if parts.is_empty() {
        return Err(StorageError::Validation(
            "multipart completion requires at least one part".to_string(),
        ));
    }
    let mut previous = 0u32;
    for part in parts {
        if part.part_number == 0 || part.part_number > MAX_PART_NUMBER {
            return Err(StorageError::Validation(format!(
                "part number {} is out of range",
                part.part_number
            )));
        }
        if part.part_number <= previous {
            return Err(StorageError::Validation(format!(
                "part {} follows part {}; parts must be strictly ascending",
                part.part_number, previous
            )));
        }
        if part.etag.is_empty() {
            return Err(StorageError::Validation(format!(
                "part {} has no etag",
                part.part_number
            )));
        }
        previous = part.part_number;
    }
    Ok(())
}

/// Multipart listings resume from a key marker plus an upload-id marker;
/// both travel inside one opaque token.
pub(crate) fn encode_upload_marker(key_marker: &str, upload_id_marker: &str) -> String {
    let json = serde_json::to_vec(&(key_marker, upload_id_marker)).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub(crate) fn decode_upload_marker(token: &str) -> StorageResult<(String, String)> {
    let invalid = || StorageError::Validation("malformed multipart listing token".to_string());
    let json = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    serde_json::from_slice(&json).map_err(|_| invalid())
}

/// HTTP client settings shared by every adapter.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub use_system_proxy: bool,
}

impl ClientOptions {
    pub fn new(config: &EngineConfig, settings: &AppSettings) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            use_system_proxy: settings.use_system_proxy,
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new(&EngineConfig::default(), &AppSettings::default())
    }
}

/// Build the adapter for a bucket. Provider selection is the pure
/// classification in [`crate::bucket`]; nothing is contacted here.
pub fn resolve(bucket: &Bucket, options: &ClientOptions) -> Result<Arc<dyn StorageAdapter>, ConfigError> {
    let adapter: Arc<dyn StorageAdapter> = match resolve_target(bucket)? {
        BucketTarget::R2(target) => Arc::new(r2::connect(bucket, &target, options)?),
        BucketTarget::S3(target) => Arc::new(s3::connect(bucket, &target, options)?),
        BucketTarget::Oss(target) => Arc::new(OssAdapter::connect(bucket, &target, options)?),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::test_bucket;

    fn part(n: u32) -> CompletedPart {
        CompletedPart {
            part_number: n,
            etag: format!("\"etag-{}\"", n),
        }
    }

    #[test]
    fn completion_must_be_strictly_ascending() {
        assert!(validate_completion(&[part(1), part(2), part(3)]).is_ok());
        assert!(matches!(
            validate_completion(&[part(2), part(1)]),
            Err(StorageError::Validation(_))
        ));
        assert!(validate_completion(&[part(1), part(1)]).is_err());
        assert!(validate_completion(&[]).is_err());
        assert!(validate_completion(&[part(0)]).is_err());
        assert!(validate_completion(&[part(MAX_PART_NUMBER + 1)]).is_err());
    }

    #[test]
    fn non_truncated_page_has_no_token() {
        let page = ListingPage::new(vec![1, 2], false, Some("next".to_string()));
        assert!(!page.is_truncated);
        assert_eq!(page.continuation_token, None);

        let page = ListingPage::new(vec![1, 2], true, None::<String>);
        assert!(!page.is_truncated);

        let page = ListingPage::new(vec![1, 2], true, Some("next".to_string()));
        assert!(page.is_truncated);
        assert_eq!(page.continuation_token.as_deref(), Some("next"));
    }

    #[test]
    fn upload_marker_round_trips() {
        let token = encode_upload_marker("videos/a.mp4", "upload-1");
        assert_eq!(
            decode_upload_marker(&token).unwrap(),
            ("videos/a.mp4".to_string(), "upload-1".to_string())
        );
        assert!(decode_upload_marker("not a token!").is_err());
    }

    #[test]
    fn resolve_picks_adapter_by_kind() {
        let options = ClientOptions::default();

        let mut oss = test_bucket(1, Some(ProviderKind::Oss));
        oss.endpoint = Some("https://oss-cn-shanghai.aliyuncs.com".to_string());
        assert_eq!(resolve(&oss, &options).unwrap().kind(), ProviderKind::Oss);

        let mut r2 = test_bucket(2, None);
        r2.s3_api = Some("https://abc123.r2.cloudflarestorage.com/mybucket".to_string());
        let adapter = resolve(&r2, &options).unwrap();
        assert_eq!(adapter.kind(), ProviderKind::R2);
        assert_eq!(adapter.bucket_name(), "mybucket");

        let mut s3 = test_bucket(3, Some(ProviderKind::S3));
        s3.endpoint = Some("https://s3.us-west-2.amazonaws.com".to_string());
        assert_eq!(resolve(&s3, &options).unwrap().kind(), ProviderKind::S3);

        let mut bad = test_bucket(4, Some(ProviderKind::Oss));
        bad.endpoint = Some("https://s3.example.com".to_string());
        assert!(resolve(&bad, &options).is_err());
    }
}
