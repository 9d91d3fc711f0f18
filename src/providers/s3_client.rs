//! Shared aws-sdk client and the S3-style adapter used by R2 and generic S3

use super::signing::{encode_uri_path, presign_aws_v4, AwsPresign, SigningCredentials};
use super::{
    decode_upload_marker, encode_upload_marker, validate_completion, ClientOptions, CompletedPart,
    ListingPage, MultipartUploadHandle, ObjectBody, RemoteObject, StorageAdapter,
};
use crate::bucket::{Endpoint, ProviderKind};
use crate::error::{ConfigError, StorageError, StorageResult};
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, SharedHttpClient};
use aws_sdk_s3::config::{RequestChecksumCalculation, ResponseChecksumValidation};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_http_client::proxy::ProxyConfig;
use aws_smithy_http_client::tls::{self, rustls_provider::CryptoMode};
use aws_smithy_http_client::{Builder as HttpClientBuilder, Connector};
use bytes::Bytes;
use chrono::Utc;

pub(crate) struct S3ClientConfig<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub endpoint_url: &'a str,
    pub provider_name: &'static str,
}

/// `HTTP(S)_PROXY`/`NO_PROXY` when the user opted into the system proxy,
/// direct connections otherwise.
pub(crate) fn proxy_config(use_system_proxy: bool) -> ProxyConfig {
    if use_system_proxy {
        ProxyConfig::from_env()
    } else {
        ProxyConfig::disabled()
    }
}

fn http_client(options: &ClientOptions) -> SharedHttpClient {
    let proxy = proxy_config(options.use_system_proxy);
    HttpClientBuilder::new().build_with_connector_fn(move |settings, components| {
        let mut builder = Connector::builder();
        builder
            .set_connector_settings(settings.cloned())
            .set_sleep_impl(components.and_then(|c| c.sleep_impl()));
        builder
            .proxy_config(proxy.clone())
            .tls_provider(tls::Provider::Rustls(CryptoMode::AwsLc))
            .build()
    })
}

/// Path-style client with SDK retries disabled; the transfer engine owns
/// the retry policy. Checksums are only sent when an operation requires
/// them, which R2 and most S3-compatible stores need.
pub(crate) fn create_s3_client(config: &S3ClientConfig<'_>, options: &ClientOptions) -> Client {
    let credentials = Credentials::new(
        config.access_key_id,
        config.secret_access_key,
        None,
        None,
        config.provider_name,
    );

    let timeouts = TimeoutConfig::builder()
        .connect_timeout(options.connect_timeout)
        .read_timeout(options.read_timeout)
        .build();

    let s3_config = S3ConfigBuilder::new()
        .credentials_provider(credentials)
        .region(Region::new(config.region.to_string()))
        .endpoint_url(config.endpoint_url)
        .force_path_style(true)
        .http_client(http_client(options))
        .timeout_config(timeouts)
        .retry_config(RetryConfig::disabled())
        .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
        .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
        .build();

    Client::from_conf(s3_config)
}

/// Classify an SDK failure: anything that never produced a usable response,
/// plus 5xx and throttling, is worth retrying.
pub(crate) fn map_sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::transient(format!("{} failed: {}", operation, detail))
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code().unwrap_or("Unknown").to_string();
            let message = service
                .err()
                .message()
                .map(str::to_string)
                .unwrap_or(detail);
            if status >= 500 || status == 429 {
                StorageError::transient_with_code(
                    code.clone(),
                    format!("{} failed ({} {}): {}", operation, status, code, message),
                )
            } else {
                StorageError::provider(code, format!("{} failed: {}", operation, message), Some(status))
            }
        }
        _ => StorageError::provider("SdkError", format!("{} failed: {}", operation, detail), None),
    }
}

/// Connection parameters for an S3-style bucket.
pub(crate) struct S3Connection<'a> {
    pub kind: ProviderKind,
    pub bucket: &'a str,
    pub endpoint_url: &'a str,
    pub region: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
}

/// Adapter over the aws-sdk client, path-style addressed.
pub struct S3CompatAdapter {
    kind: ProviderKind,
    client: Client,
    bucket: String,
    scheme: String,
    host: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3CompatAdapter {
    pub(crate) fn new(conn: &S3Connection<'_>, options: &ClientOptions) -> Result<Self, ConfigError> {
        let endpoint = Endpoint::parse(conn.endpoint_url)?;
        let client = create_s3_client(
            &S3ClientConfig {
                access_key_id: conn.access_key,
                secret_access_key: conn.secret_key,
                region: conn.region,
                endpoint_url: conn.endpoint_url,
                provider_name: match conn.kind {
                    ProviderKind::R2 => "r2-provider",
                    _ => "s3-provider",
                },
            },
            options,
        );

        Ok(Self {
            kind: conn.kind,
            client,
            bucket: conn.bucket.to_string(),
            scheme: endpoint.scheme,
            host: endpoint.host,
            region: conn.region.to_string(),
            access_key: conn.access_key.to_string(),
            secret_key: conn.secret_key.to_string(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl StorageAdapter for S3CompatAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn bucket_name(&self) -> &str {
        &self.bucket
    }

    async fn ping(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| map_sdk_error("HeadBucket", e))?;
        Ok(())
    }

    async fn put_object(&self, key: &str, body: ObjectBody, content_type: &str) -> StorageResult<()> {
        let stream = match body {
            ObjectBody::Bytes(bytes) => ByteStream::from(bytes),
            ObjectBody::File { path, .. } => ByteStream::from_path(&path)
                .await
                .map_err(std::io::Error::other)?,
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(stream)
            .send()
            .await
            .map_err(|e| map_sdk_error("PutObject", e))?;
        Ok(())
    }

    async fn initiate_multipart(&self, key: &str, content_type: &str) -> StorageResult<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| map_sdk_error("CreateMultipartUpload", e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::provider("MissingUploadId", "No upload ID returned", None))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<CompletedPart> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error("UploadPart", e))?;

        let etag = response.e_tag().unwrap_or_default().to_string();
        if etag.is_empty() {
            return Err(StorageError::provider(
                "MissingETag",
                format!("part {} returned no ETag", part_number),
                None,
            ));
        }
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        validate_completion(parts)?;

        let completed_parts: Vec<SdkCompletedPart> = parts
            .iter()
            .map(|part| {
                SdkCompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| map_sdk_error("CompleteMultipartUpload", e))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("AbortMultipartUpload", e))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        page_size: u32,
    ) -> StorageResult<ListingPage<RemoteObject>> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(page_size as i32);

        if let Some(p) = prefix {
            request = request.prefix(p);
        }
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_sdk_error("ListObjectsV2", e))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?.to_string();
                // Skip directory markers
                if key.ends_with('/') {
                    return None;
                }
                Some(RemoteObject {
                    key,
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj.last_modified().map(|dt| dt.secs()).unwrap_or_default(),
                    etag: obj.e_tag().unwrap_or_default().to_string(),
                })
            })
            .collect();

        Ok(ListingPage::new(
            objects,
            response.is_truncated().unwrap_or(false),
            response.next_continuation_token().map(str::to_string),
        ))
    }

    async fn list_multipart_uploads(
        &self,
        continuation_token: Option<&str>,
        page_size: u32,
    ) -> StorageResult<ListingPage<MultipartUploadHandle>> {
        let mut request = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .max_uploads(page_size as i32);

        if let Some(token) = continuation_token {
            let (key_marker, upload_id_marker) = decode_upload_marker(token)?;
            request = request.key_marker(key_marker);
            if !upload_id_marker.is_empty() {
                request = request.upload_id_marker(upload_id_marker);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_sdk_error("ListMultipartUploads", e))?;

        let uploads = response
            .uploads()
            .iter()
            .filter_map(|upload| {
                Some(MultipartUploadHandle {
                    key: upload.key()?.to_string(),
                    upload_id: upload.upload_id()?.to_string(),
                    initiated: upload.initiated().map(|dt| dt.secs()).unwrap_or_default(),
                })
            })
            .collect();

        let next = response
            .next_key_marker()
            .filter(|marker| !marker.is_empty())
            .map(|key_marker| {
                encode_upload_marker(key_marker, response.next_upload_id_marker().unwrap_or_default())
            });

        Ok(ListingPage::new(
            uploads,
            response.is_truncated().unwrap_or(false),
            next,
        ))
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteObject", e))?;
        Ok(())
    }

    fn presigned_url(&self, key: &str, ttl_secs: u64) -> StorageResult<String> {
        let credentials = SigningCredentials::new(&self.access_key, &self.secret_key)?;
        let canonical_uri = format!("/{}/{}", self.bucket, encode_uri_path(key));
        presign_aws_v4(
            &credentials,
            &AwsPresign {
                method: "GET",
                scheme: &self.scheme,
                host: &self.host,
                canonical_uri: &canonical_uri,
                region: &self.region,
                expires_in: ttl_secs,
            },
            Utc::now(),
        )
    }
}
