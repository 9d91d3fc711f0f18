//! Generic S3-compatible connection setup (AWS, MinIO, Wasabi, ...)

use super::s3_client::{S3CompatAdapter, S3Connection};
use super::ClientOptions;
use crate::bucket::{Bucket, ProviderKind, S3Target};
use crate::error::ConfigError;

pub(crate) fn connect(
    bucket: &Bucket,
    target: &S3Target,
    options: &ClientOptions,
) -> Result<S3CompatAdapter, ConfigError> {
    log::debug!(
        "Connecting S3 bucket {} at {} (region {})",
        target.bucket,
        target.endpoint_url,
        target.region
    );
    S3CompatAdapter::new(
        &S3Connection {
            kind: ProviderKind::S3,
            bucket: &target.bucket,
            endpoint_url: &target.endpoint_url,
            region: &target.region,
            access_key: bucket.access_key.trim(),
            secret_key: bucket.secret_key.trim(),
        },
        options,
    )
}
