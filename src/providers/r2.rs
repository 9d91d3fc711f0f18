//! Cloudflare R2 connection setup

use super::s3_client::{S3CompatAdapter, S3Connection};
use super::ClientOptions;
use crate::bucket::{Bucket, ProviderKind, R2Target};
use crate::error::ConfigError;

/// R2 signs every request with the `auto` region.
const R2_REGION: &str = "auto";

pub(crate) fn connect(
    bucket: &Bucket,
    target: &R2Target,
    options: &ClientOptions,
) -> Result<S3CompatAdapter, ConfigError> {
    log::debug!(
        "Connecting R2 bucket {} (account {})",
        target.bucket,
        target.account_id
    );
    S3CompatAdapter::new(
        &S3Connection {
            kind: ProviderKind::R2,
            bucket: &target.bucket,
            endpoint_url: &target.endpoint_url,
            region: R2_REGION,
            access_key: bucket.access_key.trim(),
            secret_key: bucket.secret_key.trim(),
        },
        options,
    )
}
