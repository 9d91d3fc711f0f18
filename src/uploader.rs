//! Lifecycle façade: one object owning every registry and service

use crate::bucket::{Bucket, BucketId};
use crate::buckets::{AdapterFactory, BucketRegistry, ProviderFactory};
use crate::catalog::RemoteCatalog;
use crate::config::{AppSettings, EngineConfig};
use crate::db::{Database, DbResult};
use crate::error::{ConfigError, StorageResult};
use crate::providers::ClientOptions;
use crate::transfer::{
    TransferEngine, TransferFilter, TransferId, TransferPage, TransferRecord, TransferRegistry,
    TransferRequest,
};
use crate::url::UrlService;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct Uploader {
    buckets: Arc<BucketRegistry>,
    transfers: Arc<TransferRegistry>,
    engine: TransferEngine,
    catalog: RemoteCatalog,
    urls: Arc<UrlService>,
    history: Option<Arc<Database>>,
}

impl Uploader {
    pub fn new(config: EngineConfig, settings: AppSettings, buckets: Vec<Bucket>) -> Result<Self, ConfigError> {
        Self::build(config, settings, buckets, Arc::new(ProviderFactory), None)
    }

    /// Same as [`Uploader::new`], with adapters produced by `factory`.
    pub fn with_factory(
        config: EngineConfig,
        settings: AppSettings,
        buckets: Vec<Bucket>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, settings, buckets, factory, None)
    }

    /// Persist terminal transfers into `db` and preload its history.
    pub async fn with_history(
        config: EngineConfig,
        settings: AppSettings,
        buckets: Vec<Bucket>,
        db: Arc<Database>,
    ) -> DbResult<Self> {
        let uploader = Self::build(config, settings, buckets, Arc::new(ProviderFactory), Some(db.clone()))?;
        let restored = uploader.transfers.restore(db.list_transfers().await?);
        info!("uploader: restored {} transfers from history", restored);
        Ok(uploader)
    }

    fn build(
        config: EngineConfig,
        settings: AppSettings,
        buckets: Vec<Bucket>,
        factory: Arc<dyn AdapterFactory>,
        history: Option<Arc<Database>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let options = ClientOptions::new(&config, &settings);
        let buckets = Arc::new(BucketRegistry::with_factory(buckets, &settings, options, factory));
        let transfers = Arc::new(TransferRegistry::new());
        let urls = Arc::new(UrlService::new(buckets.clone(), config.presign_ttl_secs));
        let catalog = RemoteCatalog::new(buckets.clone(), &config);
        let engine = TransferEngine::new(
            config,
            buckets.clone(),
            transfers.clone(),
            urls.clone(),
            history.clone(),
        )?;

        Ok(Self {
            buckets,
            transfers,
            engine,
            catalog,
            urls,
            history,
        })
    }

    pub fn buckets(&self) -> &Arc<BucketRegistry> {
        &self.buckets
    }

    pub fn transfers(&self) -> &Arc<TransferRegistry> {
        &self.transfers
    }

    pub fn catalog(&self) -> &RemoteCatalog {
        &self.catalog
    }

    pub fn urls(&self) -> &UrlService {
        &self.urls
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferRecord> {
        self.transfers.subscribe()
    }

    pub async fn submit(&self, request: TransferRequest) -> StorageResult<Vec<TransferId>> {
        self.engine.submit(request).await
    }

    /// Submit to the default bucket.
    pub async fn submit_to_default(
        &self,
        source: crate::transfer::TransferSource,
        remote_path: &str,
    ) -> StorageResult<Vec<TransferId>> {
        let bucket_id: BucketId = self
            .buckets
            .default_bucket()
            .map(|b| b.id)
            .ok_or(ConfigError::MissingField("default bucket"))?;
        self.submit(TransferRequest {
            source,
            bucket_id,
            remote_path: remote_path.to_string(),
        })
        .await
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.engine.cancel(id)
    }

    pub fn page(&self, filter: TransferFilter, page: usize, page_size: usize) -> TransferPage {
        self.transfers.page(filter, page, page_size)
    }

    /// Drop every terminal record, from memory and from the history table.
    pub async fn clear_completed(&self) -> usize {
        let cleared = self.transfers.clear_completed();
        if let Some(db) = &self.history {
            for id in &cleared {
                if let Err(e) = db.delete_transfer(id).await {
                    warn!("transfer_history: failed to delete {}: {}", id, e);
                }
            }
        }
        cleared.len()
    }

    /// Cancel all in-flight transfers and wait for them to settle.
    pub async fn shutdown(&self) {
        let cancelled = self.engine.cancel_all();
        info!("uploader: shutting down, {} transfers in flight", cancelled);
        self.engine.shutdown().await;
    }
}
