//! URL Service: custom-domain links or presigned provider URLs

use crate::bucket::BucketId;
use crate::buckets::BucketRegistry;
use crate::error::{ConfigError, StorageResult};
use std::sync::Arc;

pub struct UrlService {
    buckets: Arc<BucketRegistry>,
    ttl_secs: u64,
}

impl UrlService {
    pub fn new(buckets: Arc<BucketRegistry>, ttl_secs: u64) -> Self {
        Self { buckets, ttl_secs }
    }

    /// Public URL when the bucket has a custom domain, otherwise a signed
    /// URL valid for the configured TTL.
    pub fn url_for(&self, bucket_id: BucketId, key: &str) -> StorageResult<String> {
        let bucket = self
            .buckets
            .get(bucket_id)
            .ok_or(ConfigError::UnknownBucket(bucket_id))?;

        if let Some(domain) = bucket.custom_domain() {
            return Ok(public_url(domain, key));
        }
        self.buckets
            .adapter_for(bucket_id)?
            .presigned_url(key, self.ttl_secs)
    }

    /// Signed URL with an explicit TTL, regardless of custom domain.
    pub fn presigned_url(&self, bucket_id: BucketId, key: &str, ttl_secs: u64) -> StorageResult<String> {
        self.buckets
            .adapter_for(bucket_id)?
            .presigned_url(key, ttl_secs)
    }
}

/// `cdn.example.com` + `a/b.png` -> `https://cdn.example.com/a/b.png`
pub fn public_url(domain: &str, key: &str) -> String {
    let domain = domain.trim().trim_end_matches('/');
    let key = key.trim_start_matches('/');
    if domain.starts_with("http://") || domain.starts_with("https://") {
        format!("{}/{}", domain, key)
    } else {
        format!("https://{}/{}", domain, key)
    }
}
