//! Remote Catalog: paginated browsing plus delete/abort against a bucket

use crate::bucket::BucketId;
use crate::buckets::BucketRegistry;
use crate::config::EngineConfig;
use crate::error::{StorageError, StorageResult};
use crate::providers::{ListingPage, MultipartUploadHandle, RemoteObject, MAX_LIST_PAGE_SIZE};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque page token handed to callers. The provider token is only valid
/// for the listing it came from, so the token remembers which one.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct PageToken {
    #[serde(rename = "b")]
    bucket_id: BucketId,
    /// `None` for multipart-upload listings
    #[serde(rename = "p")]
    prefix: Option<String>,
    #[serde(rename = "u")]
    uploads: bool,
    #[serde(rename = "t")]
    provider_token: String,
}

impl PageToken {
    fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    fn decode(token: &str) -> StorageResult<Self> {
        let invalid = || StorageError::Validation("malformed page token".to_string());
        let json = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        serde_json::from_slice(&json).map_err(|_| invalid())
    }

    /// Unwrap a caller token, checking it belongs to this listing.
    fn open(
        token: Option<&str>,
        bucket_id: BucketId,
        prefix: Option<&str>,
        uploads: bool,
    ) -> StorageResult<Option<String>> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let decoded = Self::decode(token)?;
        if decoded.bucket_id != bucket_id || decoded.uploads != uploads {
            return Err(StorageError::Validation(
                "page token was issued for a different listing".to_string(),
            ));
        }
        if decoded.prefix.as_deref() != prefix {
            return Err(StorageError::Validation(
                "page token was issued for a different prefix".to_string(),
            ));
        }
        Ok(Some(decoded.provider_token))
    }
}

pub struct RemoteCatalog {
    buckets: Arc<BucketRegistry>,
    default_page_size: u32,
    max_page_size: u32,
}

impl RemoteCatalog {
    pub fn new(buckets: Arc<BucketRegistry>, config: &EngineConfig) -> Self {
        Self {
            buckets,
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size.min(MAX_LIST_PAGE_SIZE),
        }
    }

    /// Requested size clamped to `1..=max`; `None` means the default.
    pub fn page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }

    /// Authenticated no-op against the bucket, for validating settings.
    pub async fn ping(&self, bucket_id: BucketId) -> StorageResult<()> {
        self.buckets.adapter_for(bucket_id)?.ping().await
    }

    pub async fn list_objects(
        &self,
        bucket_id: BucketId,
        prefix: Option<&str>,
        page_token: Option<&str>,
        page_size: Option<u32>,
    ) -> StorageResult<ListingPage<RemoteObject>> {
        let prefix = prefix.filter(|p| !p.is_empty());
        let provider_token = PageToken::open(page_token, bucket_id, prefix, false)?;
        let adapter = self.buckets.adapter_for(bucket_id)?;
        let page = adapter
            .list_objects(prefix, provider_token.as_deref(), self.page_size(page_size))
            .await?;

        Ok(page.map_token(|provider_token| {
            PageToken {
                bucket_id,
                prefix: prefix.map(str::to_string),
                uploads: false,
                provider_token,
            }
            .encode()
        }))
    }

    pub async fn list_multipart_uploads(
        &self,
        bucket_id: BucketId,
        page_token: Option<&str>,
        page_size: Option<u32>,
    ) -> StorageResult<ListingPage<MultipartUploadHandle>> {
        let provider_token = PageToken::open(page_token, bucket_id, None, true)?;
        let adapter = self.buckets.adapter_for(bucket_id)?;
        let page = adapter
            .list_multipart_uploads(provider_token.as_deref(), self.page_size(page_size))
            .await?;

        Ok(page.map_token(|provider_token| {
            PageToken {
                bucket_id,
                prefix: None,
                uploads: true,
                provider_token,
            }
            .encode()
        }))
    }

    pub async fn delete_object(&self, bucket_id: BucketId, key: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::Validation("object key is empty".to_string()));
        }
        self.buckets.adapter_for(bucket_id)?.delete_object(key).await?;
        info!("catalog: deleted {} from bucket {}", key, bucket_id);
        Ok(())
    }

    pub async fn abort_multipart(&self, bucket_id: BucketId, key: &str, upload_id: &str) -> StorageResult<()> {
        if upload_id.is_empty() {
            return Err(StorageError::Validation("upload id is empty".to_string()));
        }
        self.buckets
            .adapter_for(bucket_id)?
            .abort_multipart(key, upload_id)
            .await?;
        info!("catalog: aborted upload {} for {} in bucket {}", upload_id, key, bucket_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_bound_to_bucket_and_prefix() {
        let token = PageToken {
            bucket_id: 1,
            prefix: Some("photos/".to_string()),
            uploads: false,
            provider_token: "abc".to_string(),
        }
        .encode();

        assert_eq!(
            PageToken::open(Some(&token), 1, Some("photos/"), false).unwrap(),
            Some("abc".to_string())
        );
        assert!(PageToken::open(Some(&token), 2, Some("photos/"), false).is_err());
        assert!(PageToken::open(Some(&token), 1, Some("videos/"), false).is_err());
        assert!(PageToken::open(Some(&token), 1, None, true).is_err());
        assert!(PageToken::open(Some("garbage"), 1, None, false).is_err());
        assert_eq!(PageToken::open(None, 1, None, false).unwrap(), None);
    }
}
