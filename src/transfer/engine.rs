//! Transfer Engine: turns submissions into tracked, cancellable tasks

use super::retry::RetryPolicy;
use super::source::expand;
use super::state::TransferRegistry;
use super::types::{TransferId, TransferRecord, TransferRequest, TransferStatus};
use super::worker::{run_transfer, TransferTask, WorkerContext};
use crate::buckets::BucketRegistry;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{ConfigError, StorageResult};
use crate::url::UrlService;
use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type CancelMap = Arc<Mutex<HashMap<TransferId, CancellationToken>>>;

pub struct TransferEngine {
    ctx: Arc<WorkerContext>,
    buckets: Arc<BucketRegistry>,
    cancels: CancelMap,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_index: AtomicU64,
}

impl TransferEngine {
    /// Fails when `config` does not validate.
    pub fn new(
        config: EngineConfig,
        buckets: Arc<BucketRegistry>,
        registry: Arc<TransferRegistry>,
        urls: Arc<UrlService>,
        history: Option<Arc<Database>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ctx = WorkerContext {
            registry,
            urls,
            retry: RetryPolicy::from_config(&config),
            admission: Arc::new(Semaphore::new(config.max_active_uploads)),
            config,
            history,
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            buckets,
            cancels: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_index: AtomicU64::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.ctx.registry
    }

    fn next_id(&self) -> TransferId {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        format!("upload-{}-{}", Utc::now().timestamp_millis(), index)
    }

    /// Expand the request into one transfer per object and start them.
    /// Ids are returned in submission order; a folder yields one id per file.
    /// Nothing is registered when the bucket is unknown or the source can't
    /// be read.
    pub async fn submit(&self, request: TransferRequest) -> StorageResult<Vec<TransferId>> {
        let adapter = self.buckets.adapter_for(request.bucket_id)?;
        let items = expand(&request.source, &request.remote_path).await?;

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let lease = self.buckets.lease(request.bucket_id)?;
            let id = self.next_id();
            let cancel = self.shutdown.child_token();

            self.ctx.registry.insert(TransferRecord {
                id: id.clone(),
                bucket_id: request.bucket_id,
                filename: item.filename.clone(),
                key: item.key.clone(),
                status: TransferStatus::Waiting,
                url: None,
                submitted_at: Utc::now().timestamp(),
            });
            self.lock_cancels().insert(id.clone(), cancel.clone());
            info!(
                "transfer_submitted: {} bucket={} key={} size={}",
                id, request.bucket_id, item.key, item.size
            );

            let task = TransferTask {
                id: id.clone(),
                bucket_id: request.bucket_id,
                item,
                adapter: adapter.clone(),
                cancel,
                lease,
            };
            let ctx = self.ctx.clone();
            let cancels = self.cancels.clone();
            self.tracker.spawn(async move {
                let id = task.id.clone();
                run_transfer(ctx, task).await;
                cancels.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            });
            ids.push(id);
        }
        Ok(ids)
    }

    fn lock_cancels(&self) -> std::sync::MutexGuard<'_, HashMap<TransferId, CancellationToken>> {
        self.cancels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request cancellation. Returns false when the transfer is unknown or
    /// already settled.
    pub fn cancel(&self, id: &str) -> bool {
        match self.lock_cancels().get(id) {
            Some(token) => {
                debug!("transfer_cancel: {}", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let cancels = self.lock_cancels();
        for token in cancels.values() {
            token.cancel();
        }
        cancels.len()
    }

    /// Cancel everything and wait until every task has settled.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("transfer_engine: shut down");
    }
}
