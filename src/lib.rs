//! Upload engine for Cloudflare R2, AWS S3 (and compatibles) and Aliyun OSS.

pub mod bucket;
pub mod buckets;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod providers;
pub mod transfer;
pub mod uploader;
pub mod url;

pub use bucket::{classify, resolve_target, Bucket, BucketId, BucketTarget, ProviderKind};
pub use buckets::{AdapterFactory, BucketLease, BucketRegistry, ProviderFactory};
pub use catalog::RemoteCatalog;
pub use config::{AppSettings, EngineConfig};
pub use db::Database;
pub use error::{ConfigError, StorageError, StorageResult};
pub use providers::{
    ClientOptions, CompletedPart, ListingPage, MultipartUploadHandle, ObjectBody, RemoteObject,
    StorageAdapter,
};
pub use transfer::{
    TransferEngine, TransferFilter, TransferId, TransferPage, TransferRecord, TransferRegistry,
    TransferRequest, TransferSource, TransferStatus,
};
pub use uploader::Uploader;
pub use url::UrlService;
