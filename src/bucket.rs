//! Bucket records and the pure classification that maps one to a provider
//!
//! Everything here is deterministic string handling over the stored
//! endpoint fields, so an adapter never needs a discovery call to sign.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

const R2_HOST_SUFFIX: &str = ".r2.cloudflarestorage.com";
const OSS_DOMAIN: &str = "aliyuncs.com";
const AWS_DOMAIN: &str = "amazonaws.com";
const DEFAULT_S3_REGION: &str = "us-east-1";

pub type BucketId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    R2,
    S3,
    Oss,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::R2 => write!(f, "r2"),
            ProviderKind::S3 => write!(f, "s3"),
            ProviderKind::Oss => write!(f, "oss"),
        }
    }
}

/// Bucket configuration as stored by the configuration UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: BucketId,
    /// Claimed provider; inferred from the endpoint fields when absent
    #[serde(rename = "type", default)]
    pub kind: Option<ProviderKind>,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub account_id: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub custom_domain: Option<String>,
    /// S3 API URL, e.g. `https://<account>.r2.cloudflarestorage.com/<bucket>`
    #[serde(default)]
    pub s3_api: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl Bucket {
    pub fn custom_domain(&self) -> Option<&str> {
        non_empty(self.custom_domain.as_deref())
    }

    /// Whether a credential or endpoint change requires a new adapter.
    pub fn connection_differs(&self, other: &Bucket) -> bool {
        self.kind != other.kind
            || self.bucket_name != other.bucket_name
            || self.account_id != other.account_id
            || self.access_key != other.access_key
            || self.secret_key != other.secret_key
            || self.s3_api != other.s3_api
            || self.endpoint != other.endpoint
            || self.region != other.region
    }
}

/// Scheme, host and path of an endpoint string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            endpoint: raw.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
            ("https", rest)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            ("http", rest)
        } else if trimmed.contains("://") {
            return Err(invalid("unsupported scheme"));
        } else {
            ("https", trimmed)
        };

        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if host.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
            return Err(invalid("host contains invalid characters"));
        }

        Ok(Endpoint {
            scheme: scheme.to_string(),
            host: host.to_ascii_lowercase(),
            path: path.trim_matches('/').to_string(),
        })
    }

    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    fn first_label(&self) -> &str {
        self.host.split('.').next().unwrap_or_default()
    }
}

/// An S3 API URL split into the fields it encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3ApiUrl {
    pub scheme: String,
    pub host: String,
    pub account_id: String,
    pub bucket: String,
}

impl S3ApiUrl {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let endpoint = Endpoint::parse(raw)?;
        if endpoint.path.is_empty() {
            return Err(ConfigError::MissingField("bucket name"));
        }
        if endpoint.path.contains('/') {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: raw.to_string(),
                reason: "expected a single bucket path segment".to_string(),
            });
        }
        let account_id = endpoint.first_label().to_string();
        if account_id.is_empty() {
            return Err(ConfigError::MissingField("account id"));
        }
        Ok(S3ApiUrl {
            account_id,
            bucket: endpoint.path.clone(),
            scheme: endpoint.scheme,
            host: endpoint.host,
        })
    }

    pub fn compose(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.host, self.bucket)
    }

    pub fn endpoint_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    pub fn is_r2(&self) -> bool {
        self.host.ends_with(R2_HOST_SUFFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct R2Target {
    pub account_id: String,
    pub bucket: String,
    pub endpoint_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Target {
    pub bucket: String,
    pub endpoint_url: String,
    pub host: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OssTarget {
    pub bucket: String,
    pub scheme: String,
    pub endpoint_host: String,
    /// Region id as it appears in the endpoint, e.g. `oss-cn-shanghai`
    pub region: String,
}

/// Fully derived connection parameters for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketTarget {
    R2(R2Target),
    S3(S3Target),
    Oss(OssTarget),
}

impl BucketTarget {
    pub fn kind(&self) -> ProviderKind {
        match self {
            BucketTarget::R2(_) => ProviderKind::R2,
            BucketTarget::S3(_) => ProviderKind::S3,
            BucketTarget::Oss(_) => ProviderKind::Oss,
        }
    }
}

/// Pick the provider for a bucket: the claimed kind when present, otherwise
/// inferred from the endpoint fields. Never falls back to a default.
pub fn classify(bucket: &Bucket) -> Result<ProviderKind, ConfigError> {
    if let Some(kind) = bucket.kind {
        return Ok(kind);
    }

    let endpoint = non_empty(bucket.endpoint.as_deref());
    let s3_api = non_empty(bucket.s3_api.as_deref());

    if endpoint.is_some_and(|ep| ep.contains(OSS_DOMAIN)) {
        return Ok(ProviderKind::Oss);
    }
    let r2_host = |raw: &str| {
        Endpoint::parse(raw)
            .map(|ep| ep.host.ends_with(R2_HOST_SUFFIX))
            .unwrap_or(false)
    };
    if s3_api.is_some_and(r2_host) || endpoint.is_some_and(r2_host) {
        return Ok(ProviderKind::R2);
    }
    if s3_api.is_some() || endpoint.is_some() {
        return Ok(ProviderKind::S3);
    }
    if !bucket.account_id.trim().is_empty() && !bucket.bucket_name.trim().is_empty() {
        return Ok(ProviderKind::R2);
    }
    Err(ConfigError::UnrecognizedProvider)
}

/// Derive the connection target, validating that the fields are
/// self-consistent for the resolved provider kind.
pub fn resolve_target(bucket: &Bucket) -> Result<BucketTarget, ConfigError> {
    if bucket.access_key.trim().is_empty() {
        return Err(ConfigError::MissingField("access key"));
    }
    if bucket.secret_key.trim().is_empty() {
        return Err(ConfigError::MissingField("secret key"));
    }

    match classify(bucket)? {
        ProviderKind::R2 => r2_target(bucket).map(BucketTarget::R2),
        ProviderKind::S3 => s3_target(bucket).map(BucketTarget::S3),
        ProviderKind::Oss => oss_target(bucket).map(BucketTarget::Oss),
    }
}

fn r2_target(bucket: &Bucket) -> Result<R2Target, ConfigError> {
    if let Some(raw) = non_empty(bucket.s3_api.as_deref()) {
        let api = S3ApiUrl::parse(raw)?;
        if !api.is_r2() {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: raw.to_string(),
                reason: "not an R2 S3 API URL".to_string(),
            });
        }
        return Ok(R2Target {
            endpoint_url: api.endpoint_url(),
            account_id: api.account_id,
            bucket: api.bucket,
        });
    }

    let account_id = required(&bucket.account_id, "account id")?;
    let name = required(&bucket.bucket_name, "bucket name")?;
    Ok(R2Target {
        endpoint_url: format!("https://{}{}", account_id, R2_HOST_SUFFIX),
        account_id: account_id.to_string(),
        bucket: name.to_string(),
    })
}

fn s3_target(bucket: &Bucket) -> Result<S3Target, ConfigError> {
    let (endpoint, name) = if let Some(raw) = non_empty(bucket.s3_api.as_deref()) {
        let api = S3ApiUrl::parse(raw)?;
        (Endpoint::parse(&api.endpoint_url())?, api.bucket)
    } else {
        let raw = non_empty(bucket.endpoint.as_deref()).ok_or(ConfigError::MissingField("endpoint"))?;
        let endpoint = Endpoint::parse(raw)?;
        let name = if endpoint.path.is_empty() {
            required(&bucket.bucket_name, "bucket name")?.to_string()
        } else {
            endpoint.path.clone()
        };
        (endpoint, name)
    };

    Ok(S3Target {
        region: derive_s3_region(&endpoint.host, bucket.region.as_deref()),
        endpoint_url: endpoint.origin(),
        host: endpoint.host,
        bucket: name,
    })
}

fn oss_target(bucket: &Bucket) -> Result<OssTarget, ConfigError> {
    let raw = non_empty(bucket.endpoint.as_deref()).ok_or(ConfigError::MissingField("endpoint"))?;
    let endpoint = Endpoint::parse(raw)?;
    if !endpoint.host.ends_with(OSS_DOMAIN) {
        return Err(ConfigError::InvalidEndpoint {
            endpoint: raw.to_string(),
            reason: format!("OSS endpoints must be under {}", OSS_DOMAIN),
        });
    }
    let region = oss_region_from_endpoint(raw).ok_or_else(|| ConfigError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason: "cannot derive an oss- region prefix".to_string(),
    })?;
    let name = required(&bucket.bucket_name, "bucket name")?;

    Ok(OssTarget {
        bucket: name.to_string(),
        scheme: endpoint.scheme,
        endpoint_host: endpoint.host,
        region,
    })
}

/// `https://oss-cn-shanghai.aliyuncs.com` -> `oss-cn-shanghai`
pub fn oss_region_from_endpoint(endpoint: &str) -> Option<String> {
    let host = endpoint
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let label = host.split('.').next()?;
    if label.starts_with("oss-") && label.len() > "oss-".len() {
        Some(label.to_ascii_lowercase())
    } else {
        None
    }
}

/// Region used in the OSS V4 credential scope: `oss-cn-shanghai` -> `cn-shanghai`.
pub fn oss_signing_region(region: &str) -> &str {
    let region = region.strip_prefix("oss-").unwrap_or(region);
    region.strip_suffix("-internal").unwrap_or(region)
}

/// Signing region for an S3-style host. An explicit region wins; AWS hosts
/// carry theirs in the name; R2 always signs with `auto`.
pub fn derive_s3_region(host: &str, explicit: Option<&str>) -> String {
    if let Some(region) = non_empty(explicit) {
        return region.to_string();
    }
    if host.ends_with(R2_HOST_SUFFIX) {
        return "auto".to_string();
    }
    if let Some(prefix) = host.strip_suffix(&format!(".{}", AWS_DOMAIN)) {
        // s3.<region>, s3-<region>, <bucket>.s3.<region>
        let labels: Vec<&str> = prefix.split('.').collect();
        if let Some(pos) = labels.iter().position(|l| *l == "s3" || l.starts_with("s3-")) {
            if let Some(region) = labels[pos].strip_prefix("s3-") {
                return region.to_string();
            }
            if let Some(region) = labels.get(pos + 1) {
                if *region != "dualstack" {
                    return region.to_string();
                }
                if let Some(region) = labels.get(pos + 2) {
                    return region.to_string();
                }
            }
        }
    }
    DEFAULT_S3_REGION.to_string()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ConfigError::MissingField(field))
    } else {
        Ok(trimmed)
    }
}

#[cfg(test)]
pub(crate) fn test_bucket(id: BucketId, kind: Option<ProviderKind>) -> Bucket {
    Bucket {
        id,
        kind,
        bucket_name: "mybucket".to_string(),
        account_id: String::new(),
        access_key: "AKIDEXAMPLE".to_string(),
        secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
        custom_domain: None,
        s3_api: None,
        endpoint: None,
        region: None,
    }
}
