//! Local request signing: AWS Signature V4 presigned URLs and Aliyun OSS V4
//! (header authorization and presigned URLs). No network access.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const AWS_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const OSS_ALGORITHM: &str = "OSS4-HMAC-SHA256";
const OSS_TERMINATOR: &str = "aliyun_v4_request";

/// Access key pair validated for use in a signature.
#[derive(Clone)]
pub struct SigningCredentials {
    access_key: String,
    secret_key: String,
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl SigningCredentials {
    /// Rejects keys a provider could never accept instead of producing an
    /// unusable signature.
    pub fn new(access_key: &str, secret_key: &str) -> StorageResult<Self> {
        let well_formed = |value: &str| !value.is_empty() && value.chars().all(|c| c.is_ascii_graphic());
        if !well_formed(access_key) {
            return Err(StorageError::Signing("malformed access key".to_string()));
        }
        if !well_formed(secret_key) {
            return Err(StorageError::Signing("malformed secret key".to_string()));
        }
        Ok(Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::Signing(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn derive_key(
    seed: String,
    date_stamp: &str,
    region: &str,
    service: &str,
    terminator: &str,
) -> StorageResult<Vec<u8>> {
    let k_date = hmac_sha256(seed.as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, terminator.as_bytes())
}

pub(crate) fn aws_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> StorageResult<Vec<u8>> {
    derive_key(format!("AWS4{}", secret_key), date_stamp, region, service, "aws4_request")
}

pub(crate) fn oss_signing_key(secret_key: &str, date_stamp: &str, region: &str) -> StorageResult<Vec<u8>> {
    derive_key(format!("aliyun_v4{}", secret_key), date_stamp, region, "oss", OSS_TERMINATOR)
}

/// Encode URI path - encode each segment individually, keep / as separator
pub(crate) fn encode_uri_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Sorted, encoded query string. Parameters without a value are emitted as
/// the bare key, the way OSS expects sub-resources such as `uploads`.
pub(crate) fn canonical_query(params: &[(&str, Option<&str>)]) -> String {
    let mut encoded: Vec<(String, Option<String>)> = params
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                v.map(|v| urlencoding::encode(v).into_owned()),
            )
        })
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| match v {
            Some(v) => format!("{}={}", k, v),
            None => k,
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Target of an AWS SigV4 presigned request.
pub struct AwsPresign<'a> {
    pub method: &'a str,
    pub scheme: &'a str,
    pub host: &'a str,
    /// Already-encoded absolute path, e.g. `/bucket/key`
    pub canonical_uri: &'a str,
    pub region: &'a str,
    pub expires_in: u64,
}

/// Generate AWS Signature V4 presigned URL
pub fn presign_aws_v4(
    credentials: &SigningCredentials,
    request: &AwsPresign<'_>,
    now: DateTime<Utc>,
) -> StorageResult<String> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let service = "s3";
    let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, request.region, service);
    let credential = format!("{}/{}", credentials.access_key, credential_scope);
    let expires = request.expires_in.to_string();

    let canonical_query_string = canonical_query(&[
        ("X-Amz-Algorithm", Some(AWS_ALGORITHM)),
        ("X-Amz-Credential", Some(credential.as_str())),
        ("X-Amz-Date", Some(amz_date.as_str())),
        ("X-Amz-Expires", Some(expires.as_str())),
        ("X-Amz-SignedHeaders", Some("host")),
    ]);

    let canonical_request = format!(
        "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
        request.method, request.canonical_uri, canonical_query_string, request.host, UNSIGNED_PAYLOAD
    );

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        AWS_ALGORITHM,
        amz_date,
        credential_scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = aws_signing_key(&credentials.secret_key, &date_stamp, request.region, service)?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(format!(
        "{}://{}{}?{}&X-Amz-Signature={}",
        request.scheme, request.host, request.canonical_uri, canonical_query_string, signature
    ))
}

/// Bucket-level parameters shared by every OSS signature.
pub struct OssScope<'a> {
    pub bucket: &'a str,
    /// Virtual-hosted host, `<bucket>.<endpoint host>`
    pub host: &'a str,
    /// Region in the credential scope, e.g. `cn-shanghai`
    pub region: &'a str,
}

impl OssScope<'_> {
    /// OSS V4 canonical URI always names the bucket, even for
    /// virtual-hosted requests.
    fn canonical_uri(&self, key: &str) -> String {
        if key.is_empty() {
            format!("/{}/", self.bucket)
        } else {
            format!("/{}/{}", self.bucket, encode_uri_path(key))
        }
    }
}

fn oss_string_to_sign(
    credentials: &SigningCredentials,
    scope: &OssScope<'_>,
    canonical_request: &str,
    now: DateTime<Utc>,
) -> StorageResult<String> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
    let credential_scope = format!("{}/{}/oss/{}", date_stamp, scope.region, OSS_TERMINATOR);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        OSS_ALGORITHM,
        date_time,
        credential_scope,
        sha256_hex(canonical_request.as_bytes())
    );
    let signing_key = oss_signing_key(&credentials.secret_key, &date_stamp, scope.region)?;
    Ok(hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?))
}

/// Headers to attach to a signed OSS request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OssSignedHeaders {
    pub date: String,
    pub content_sha256: &'static str,
    pub authorization: String,
}

/// Sign an OSS request with the V4 `Authorization` header.
pub fn sign_oss_request(
    credentials: &SigningCredentials,
    scope: &OssScope<'_>,
    method: &str,
    key: &str,
    query: &[(&str, Option<&str>)],
    content_type: Option<&str>,
    now: DateTime<Utc>,
) -> StorageResult<OssSignedHeaders> {
    let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let mut headers: Vec<(&str, String)> = vec![
        ("host", scope.host.to_string()),
        ("x-oss-content-sha256", UNSIGNED_PAYLOAD.to_string()),
        ("x-oss-date", date_time.clone()),
    ];
    if let Some(ct) = content_type {
        headers.push(("content-type", ct.trim().to_string()));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\nhost\n{}",
        method,
        scope.canonical_uri(key),
        canonical_query(query),
        canonical_headers,
        UNSIGNED_PAYLOAD
    );
    let signature = oss_string_to_sign(credentials, scope, &canonical_request, now)?;

    Ok(OssSignedHeaders {
        date: date_time,
        content_sha256: UNSIGNED_PAYLOAD,
        authorization: format!(
            "{} Credential={}/{}/{}/oss/{},AdditionalHeaders=host,Signature={}",
            OSS_ALGORITHM, credentials.access_key, date_stamp, scope.region, OSS_TERMINATOR, signature
        ),
    })
}

/// Generate OSS presigned GET URL (OSS V4 query signature)
pub fn presign_oss_v4(
    credentials: &SigningCredentials,
    scope: &OssScope<'_>,
    scheme: &str,
    key: &str,
    expires_in: u64,
    now: DateTime<Utc>,
) -> StorageResult<String> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
    let credential = format!(
        "{}/{}/{}/oss/{}",
        credentials.access_key, date_stamp, scope.region, OSS_TERMINATOR
    );
    let expires = expires_in.to_string();

    let canonical_query_string = canonical_query(&[
        ("x-oss-additional-headers", Some("host")),
        ("x-oss-credential", Some(credential.as_str())),
        ("x-oss-date", Some(date_time.as_str())),
        ("x-oss-expires", Some(expires.as_str())),
        ("x-oss-signature-version", Some(OSS_ALGORITHM)),
    ]);

    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
        scope.canonical_uri(key),
        canonical_query_string,
        scope.host,
        UNSIGNED_PAYLOAD
    );
    let signature = oss_string_to_sign(credentials, scope, &canonical_request, now)?;

    Ok(format!(
        "{}://{}/{}?{}&x-oss-signature={}",
        scheme,
        scope.host,
        encode_uri_path(key),
        canonical_query_string,
        signature
    ))
}
