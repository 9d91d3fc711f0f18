//! Aliyun OSS adapter: signed HTTP requests over reqwest, XML bodies

mod xml;

use super::signing::{
    canonical_query, encode_uri_path, presign_oss_v4, sign_oss_request, OssScope, SigningCredentials,
};
use super::{
    decode_upload_marker, encode_upload_marker, validate_completion, ClientOptions, CompletedPart,
    ListingPage, MultipartUploadHandle, ObjectBody, RemoteObject, StorageAdapter,
};
use crate::bucket::{oss_signing_region, Bucket, OssTarget, ProviderKind};
use crate::error::{ConfigError, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Body, Method, Response};
use tokio_util::io::ReaderStream;

pub struct OssAdapter {
    http: reqwest::Client,
    bucket: String,
    scheme: String,
    /// `<bucket>.<endpoint host>`
    host: String,
    /// Credential-scope region, e.g. `cn-shanghai`
    region: String,
    /// Where requests are sent; the virtual-hosted origin in production
    origin: String,
    access_key: String,
    secret_key: String,
}

/// One signed OSS request, before it is sent.
struct OssRequest<'a> {
    method: Method,
    key: &'a str,
    query: Vec<(&'a str, Option<String>)>,
    content_type: Option<&'a str>,
}

impl<'a> OssRequest<'a> {
    fn new(method: Method, key: &'a str) -> Self {
        Self {
            method,
            key,
            query: Vec::new(),
            content_type: None,
        }
    }

    fn param(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.query.push((name, Some(value.into())));
        self
    }

    fn sub_resource(mut self, name: &'a str) -> Self {
        self.query.push((name, None));
        self
    }

    fn content_type(mut self, content_type: &'a str) -> Self {
        self.content_type = Some(content_type);
        self
    }
}

impl OssAdapter {
    pub(crate) fn connect(
        bucket: &Bucket,
        target: &OssTarget,
        options: &ClientOptions,
    ) -> Result<Self, ConfigError> {
        let host = format!("{}.{}", target.bucket, target.endpoint_host);
        let origin = format!("{}://{}", target.scheme, host);
        log::debug!("Connecting OSS bucket {} via {}", target.bucket, origin);
        Self::with_origin(bucket, target, options, origin)
    }

    /// Same as [`OssAdapter::connect`] but sends requests to `origin`
    /// while still signing for the real virtual-hosted host.
    pub(crate) fn with_origin(
        bucket: &Bucket,
        target: &OssTarget,
        options: &ClientOptions,
        origin: String,
    ) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout);
        if !options.use_system_proxy {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| ConfigError::InvalidSetting(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            bucket: target.bucket.clone(),
            scheme: target.scheme.clone(),
            host: format!("{}.{}", target.bucket, target.endpoint_host),
            region: oss_signing_region(&target.region).to_string(),
            origin: origin.trim_end_matches('/').to_string(),
            access_key: bucket.access_key.trim().to_string(),
            secret_key: bucket.secret_key.trim().to_string(),
        })
    }

    fn scope(&self) -> OssScope<'_> {
        OssScope {
            bucket: &self.bucket,
            host: &self.host,
            region: &self.region,
        }
    }

    fn credentials(&self) -> StorageResult<SigningCredentials> {
        SigningCredentials::new(&self.access_key, &self.secret_key)
    }

    async fn send(
        &self,
        operation: &str,
        request: OssRequest<'_>,
        body: Option<Body>,
        content_length: Option<u64>,
    ) -> StorageResult<Response> {
        let query: Vec<(&str, Option<&str>)> = request
            .query
            .iter()
            .map(|(k, v)| (*k, v.as_deref()))
            .collect();

        let signed = sign_oss_request(
            &self.credentials()?,
            &self.scope(),
            request.method.as_str(),
            request.key,
            &query,
            request.content_type,
            Utc::now(),
        )?;

        let query_string = canonical_query(&query);
        let mut url = format!("{}/{}", self.origin, encode_uri_path(request.key));
        if !query_string.is_empty() {
            url.push('?');
            url.push_str(&query_string);
        }

        let mut builder = self
            .http
            .request(request.method, &url)
            .header("x-oss-date", &signed.date)
            .header("x-oss-content-sha256", signed.content_sha256)
            .header("Authorization", &signed.authorization);
        if let Some(ct) = request.content_type {
            builder = builder.header("Content-Type", ct.trim());
        }
        if let Some(len) = content_length {
            builder = builder.header("Content-Length", len);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| StorageError::transient(format!("{} failed: {}", operation, e)))?;

        if response.status().is_success() {
            return Ok(response);
        }
        Err(Self::error_from_response(operation, response).await)
    }

    async fn error_from_response(operation: &str, response: Response) -> StorageError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let (code, message) = match xml::parse::<xml::ErrorResponse>(operation, &text) {
            Ok(err) => (err.code, err.message),
            Err(_) => (format!("HTTP{}", status), text),
        };

        if status >= 500 || status == 429 {
            StorageError::transient_with_code(
                code.clone(),
                format!("{} failed ({} {}): {}", operation, status, code, message),
            )
        } else {
            StorageError::provider(code, format!("{} failed: {}", operation, message), Some(status))
        }
    }

    async fn read_text(operation: &str, response: Response) -> StorageResult<String> {
        response
            .text()
            .await
            .map_err(|e| StorageError::transient(format!("{}: failed to read response: {}", operation, e)))
    }
}

#[async_trait]
impl StorageAdapter for OssAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Oss
    }

    fn bucket_name(&self) -> &str {
        &self.bucket
    }

    async fn ping(&self) -> StorageResult<()> {
        let request = OssRequest::new(Method::GET, "").sub_resource("bucketInfo");
        self.send("GetBucketInfo", request, None, None).await?;
        Ok(())
    }

    async fn put_object(&self, key: &str, body: ObjectBody, content_type: &str) -> StorageResult<()> {
        let (body, len) = match body {
            ObjectBody::Bytes(bytes) => {
                let len = bytes.len() as u64;
                (Body::from(bytes), len)
            }
            ObjectBody::File { path, len } => {
                let file = tokio::fs::File::open(&path).await?;
                (Body::wrap_stream(ReaderStream::new(file)), len)
            }
        };
        let request = OssRequest::new(Method::PUT, key).content_type(content_type);
        self.send("PutObject", request, Some(body), Some(len)).await?;
        Ok(())
    }

    async fn initiate_multipart(&self, key: &str, content_type: &str) -> StorageResult<String> {
        let request = OssRequest::new(Method::POST, key)
            .sub_resource("uploads")
            .content_type(content_type);
        let response = self.send("InitiateMultipartUpload", request, None, None).await?;
        let text = Self::read_text("InitiateMultipartUpload", response).await?;
        let result: xml::InitiateMultipartUploadResult = xml::parse("InitiateMultipartUpload", &text)?;
        Ok(result.upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<CompletedPart> {
        let len = body.len() as u64;
        let request = OssRequest::new(Method::PUT, key)
            .param("partNumber", part_number.to_string())
            .param("uploadId", upload_id);
        let response = self
            .send("UploadPart", request, Some(Body::from(body)), Some(len))
            .await?;

        let etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
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
        let body = xml::completion_body(parts)?;
        let len = body.len() as u64;
        let request = OssRequest::new(Method::POST, key)
            .param("uploadId", upload_id)
            .content_type("application/xml");
        self.send("CompleteMultipartUpload", request, Some(Body::from(body)), Some(len))
            .await?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let request = OssRequest::new(Method::DELETE, key).param("uploadId", upload_id);
        self.send("AbortMultipartUpload", request, None, None).await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        page_size: u32,
    ) -> StorageResult<ListingPage<RemoteObject>> {
        let mut request = OssRequest::new(Method::GET, "")
            .param("list-type", "2")
            .param("max-keys", page_size.to_string());
        if let Some(p) = prefix {
            request = request.param("prefix", p);
        }
        if let Some(token) = continuation_token {
            request = request.param("continuation-token", token);
        }

        let response = self.send("ListObjectsV2", request, None, None).await?;
        let text = Self::read_text("ListObjectsV2", response).await?;
        let result: xml::ListBucketResult = xml::parse("ListObjectsV2", &text)?;

        let objects = result
            .contents
            .into_iter()
            // Skip directory markers
            .filter(|obj| !obj.key.ends_with('/'))
            .map(|obj| RemoteObject {
                last_modified: xml::unix_seconds(&obj.last_modified),
                key: obj.key,
                size: obj.size,
                etag: obj.etag,
            })
            .collect();

        Ok(ListingPage::new(
            objects,
            result.is_truncated,
            result.next_continuation_token,
        ))
    }

    async fn list_multipart_uploads(
        &self,
        continuation_token: Option<&str>,
        page_size: u32,
    ) -> StorageResult<ListingPage<MultipartUploadHandle>> {
        let mut request = OssRequest::new(Method::GET, "")
            .sub_resource("uploads")
            .param("max-uploads", page_size.to_string());
        if let Some(token) = continuation_token {
            let (key_marker, upload_id_marker) = decode_upload_marker(token)?;
            request = request.param("key-marker", key_marker);
            if !upload_id_marker.is_empty() {
                request = request.param("upload-id-marker", upload_id_marker);
            }
        }

        let response = self.send("ListMultipartUploads", request, None, None).await?;
        let text = Self::read_text("ListMultipartUploads", response).await?;
        let result: xml::ListMultipartUploadsResult = xml::parse("ListMultipartUploads", &text)?;

        let uploads = result
            .upload
            .into_iter()
            .map(|upload| MultipartUploadHandle {
                initiated: xml::unix_seconds(&upload.initiated),
                key: upload.key,
                upload_id: upload.upload_id,
            })
            .collect();

        let next = result
            .next_key_marker
            .filter(|marker| !marker.is_empty())
            .map(|key_marker| {
                encode_upload_marker(&key_marker, result.next_upload_id_marker.as_deref().unwrap_or_default())
            });

        Ok(ListingPage::new(uploads, result.is_truncated, next))
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        let request = OssRequest::new(Method::DELETE, key);
        self.send("DeleteObject", request, None, None).await?;
        Ok(())
    }

    fn presigned_url(&self, key: &str, ttl_secs: u64) -> StorageResult<String> {
        presign_oss_v4(
            &self.credentials()?,
            &self.scope(),
            &self.scheme,
            key,
            ttl_secs,
            Utc::now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{resolve_target, test_bucket, BucketTarget};
    use wiremock::matchers::{body_string_contains, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oss_bucket() -> Bucket {
        let mut bucket = test_bucket(7, Some(ProviderKind::Oss));
        bucket.endpoint = Some("https://oss-cn-shanghai.aliyuncs.com".to_string());
        bucket
    }

    fn adapter_for(server: &MockServer) -> OssAdapter {
        let bucket = oss_bucket();
        let BucketTarget::Oss(target) = resolve_target(&bucket).unwrap() else {
            panic!("expected an OSS target");
        };
        OssAdapter::with_origin(&bucket, &target, &ClientOptions::default(), server.uri()).unwrap()
    }

    #[tokio::test]
    async fn initiate_multipart_reads_upload_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/big.bin"))
            .and(query_param("uploads", ""))
            .and(header_exists("authorization"))
            .and(header_exists("x-oss-date"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><Bucket>mybucket</Bucket><Key>big.bin</Key>\
                 <UploadId>0004B9894A22E5B1888A1E29F823****</UploadId></InitiateMultipartUploadResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let upload_id = adapter
            .initiate_multipart("big.bin", "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(upload_id, "0004B9894A22E5B1888A1E29F823****");
    }

    #[tokio::test]
    async fn upload_part_returns_etag_header() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/big.bin"))
            .and(query_param("partNumber", "2"))
            .and(query_param("uploadId", "u-1"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"abc\""))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let part = adapter
            .upload_part("big.bin", "u-1", 2, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(part, CompletedPart { part_number: 2, etag: "\"abc\"".to_string() });
    }

    #[tokio::test]
    async fn complete_sends_ordered_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/big.bin"))
            .and(query_param("uploadId", "u-1"))
            .and(body_string_contains("<PartNumber>1</PartNumber>"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let parts = vec![
            CompletedPart { part_number: 1, etag: "a".to_string() },
            CompletedPart { part_number: 2, etag: "b".to_string() },
        ];
        adapter.complete_multipart("big.bin", "u-1", &parts).await.unwrap();

        // Out of order parts never reach the provider
        let reversed = vec![parts[1].clone(), parts[0].clone()];
        assert!(matches!(
            adapter.complete_multipart("big.bin", "u-1", &reversed).await,
            Err(StorageError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn client_errors_keep_provider_code() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/big.bin"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                "<Error><Code>NoSuchUpload</Code><Message>The specified upload does not exist.</Message></Error>",
            ))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let err = adapter.abort_multipart("big.bin", "missing").await.unwrap_err();
        match err {
            StorageError::Provider { code, status, .. } => {
                assert_eq!(code, "NoSuchUpload");
                assert_eq!(status, Some(404));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string(
                "<Error><Code>ServiceUnavailable</Code><Message>busy</Message></Error>",
            ))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let err = adapter.list_objects(None, None, 10).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.code(), "ServiceUnavailable");
    }

    #[tokio::test]
    async fn list_objects_maps_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("list-type", "2"))
            .and(query_param("max-keys", "2"))
            .and(query_param("prefix", "photos/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult><Name>mybucket</Name><IsTruncated>false</IsTruncated>\
                 <NextContinuationToken>ignored</NextContinuationToken>\
                 <Contents><Key>photos/</Key><Size>0</Size></Contents>\
                 <Contents><Key>photos/a.png</Key><LastModified>2024-01-02T03:04:05.000Z</LastModified>\
                 <ETag>\"e1\"</ETag><Size>12</Size></Contents></ListBucketResult>",
            ))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let page = adapter.list_objects(Some("photos/"), None, 2).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].key, "photos/a.png");
        assert_eq!(page.items[0].size, 12);
        assert!(!page.is_truncated);
        assert_eq!(page.continuation_token, None);
    }

    #[tokio::test]
    async fn list_uploads_wraps_markers_in_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListMultipartUploadsResult><Bucket>mybucket</Bucket><IsTruncated>true</IsTruncated>\
                 <NextKeyMarker>b.bin</NextKeyMarker><NextUploadIdMarker>u-2</NextUploadIdMarker>\
                 <Upload><Key>a.bin</Key><UploadId>u-1</UploadId><Initiated>2024-01-02T03:04:05.000Z</Initiated></Upload>\
                 <Upload><Key>b.bin</Key><UploadId>u-2</UploadId><Initiated>2024-01-02T03:04:06.000Z</Initiated></Upload>\
                 </ListMultipartUploadsResult>",
            ))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let page = adapter.list_multipart_uploads(None, 2).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.is_truncated);
        let token = page.continuation_token.unwrap();
        assert_eq!(
            decode_upload_marker(&token).unwrap(),
            ("b.bin".to_string(), "u-2".to_string())
        );
    }

    #[test]
    fn presigned_url_uses_virtual_host() {
        let bucket = oss_bucket();
        let BucketTarget::Oss(target) = resolve_target(&bucket).unwrap() else {
            panic!("expected an OSS target");
        };
        let adapter = OssAdapter::connect(&bucket, &target, &ClientOptions::default()).unwrap();
        let url = adapter.presigned_url("a.txt", 600).unwrap();
        assert!(url.starts_with("https://mybucket.oss-cn-shanghai.aliyuncs.com/a.txt?"));
        assert!(url.contains("%2Fcn-shanghai%2Foss%2F"));
    }
}
