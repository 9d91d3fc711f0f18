//! Bucket Registry: configured buckets, default selection and memoized adapters

use crate::bucket::{resolve_target, Bucket, BucketId};
use crate::config::AppSettings;
use crate::error::ConfigError;
use crate::providers::{self, ClientOptions, StorageAdapter};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// Builds the adapter for a bucket. The default goes through
/// [`providers::resolve`]; tests substitute scripted adapters.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        bucket: &Bucket,
        options: &ClientOptions,
    ) -> Result<Arc<dyn StorageAdapter>, ConfigError>;
}

pub struct ProviderFactory;

impl AdapterFactory for ProviderFactory {
    fn create(
        &self,
        bucket: &Bucket,
        options: &ClientOptions,
    ) -> Result<Arc<dyn StorageAdapter>, ConfigError> {
        providers::resolve(bucket, options)
    }
}

#[derive(Default)]
struct Buckets {
    buckets: BTreeMap<BucketId, Bucket>,
    default_id: Option<BucketId>,
    adapters: HashMap<BucketId, Arc<dyn StorageAdapter>>,
}

type LeaseCounts = Arc<Mutex<HashMap<BucketId, usize>>>;

/// Held by a transfer for as long as it may touch its bucket.
pub struct BucketLease {
    bucket_id: BucketId,
    counts: LeaseCounts,
}

impl Drop for BucketLease {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&self.bucket_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.bucket_id);
            }
        }
    }
}

pub struct BucketRegistry {
    state: RwLock<Buckets>,
    leases: LeaseCounts,
    factory: Arc<dyn AdapterFactory>,
    options: ClientOptions,
    refresh: watch::Sender<u64>,
}

impl BucketRegistry {
    pub fn new(buckets: Vec<Bucket>, settings: &AppSettings, options: ClientOptions) -> Self {
        Self::with_factory(buckets, settings, options, Arc::new(ProviderFactory))
    }

    pub fn with_factory(
        buckets: Vec<Bucket>,
        settings: &AppSettings,
        options: ClientOptions,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        let buckets: BTreeMap<BucketId, Bucket> = buckets.into_iter().map(|b| (b.id, b)).collect();
        let known = |id: &BucketId| buckets.contains_key(id);
        let default_id = settings
            .default_bucket_id
            .filter(known)
            .or(settings.last_active_bucket_id.filter(known))
            .or_else(|| buckets.keys().next().copied());
        let (refresh, _) = watch::channel(0);

        Self {
            state: RwLock::new(Buckets {
                buckets,
                default_id,
                adapters: HashMap::new(),
            }),
            leases: Arc::new(Mutex::new(HashMap::new())),
            factory,
            options,
            refresh,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Buckets> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Buckets> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.refresh.send_modify(|version| *version += 1);
        debug!("bucket_registry: refresh -> {}", *self.refresh.borrow());
    }

    /// Observe bucket-list changes. The value increases on every add, edit
    /// or removal.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.refresh.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.refresh.borrow()
    }

    pub fn list(&self) -> Vec<Bucket> {
        self.read().buckets.values().cloned().collect()
    }

    pub fn get(&self, id: BucketId) -> Option<Bucket> {
        self.read().buckets.get(&id).cloned()
    }

    pub fn default_bucket(&self) -> Option<Bucket> {
        let state = self.read();
        state.default_id.and_then(|id| state.buckets.get(&id).cloned())
    }

    pub fn set_default(&self, id: BucketId) -> Result<(), ConfigError> {
        {
            let mut state = self.write();
            if !state.buckets.contains_key(&id) {
                return Err(ConfigError::UnknownBucket(id));
            }
            state.default_id = Some(id);
        }
        self.bump();
        Ok(())
    }

    /// Add or replace a bucket. The memoized adapter is dropped when
    /// credentials or endpoint fields changed.
    pub fn upsert(&self, bucket: Bucket) -> Result<(), ConfigError> {
        resolve_target(&bucket)?;
        {
            let mut state = self.write();
            let id = bucket.id;
            let stale = state
                .buckets
                .get(&id)
                .is_some_and(|existing| existing.connection_differs(&bucket));
            if stale {
                state.adapters.remove(&id);
                info!("bucket_registry: connection changed for bucket {}", id);
            }
            state.buckets.insert(id, bucket);
            if state.default_id.is_none() {
                state.default_id = Some(id);
            }
        }
        self.bump();
        Ok(())
    }

    /// Remove a bucket that no transfer references.
    pub fn remove(&self, id: BucketId) -> Result<Bucket, ConfigError> {
        let removed = {
            let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
            if leases.get(&id).is_some_and(|count| *count > 0) {
                return Err(ConfigError::BucketInUse(id));
            }
            let mut state = self.write();
            let removed = state.buckets.remove(&id).ok_or(ConfigError::UnknownBucket(id))?;
            state.adapters.remove(&id);
            if state.default_id == Some(id) {
                state.default_id = state.buckets.keys().next().copied();
            }
            removed
        };
        info!("bucket_registry: removed bucket {}", id);
        self.bump();
        Ok(removed)
    }

    /// Adapter for a bucket, created on first use.
    pub fn adapter_for(&self, id: BucketId) -> Result<Arc<dyn StorageAdapter>, ConfigError> {
        if let Some(adapter) = self.read().adapters.get(&id) {
            return Ok(adapter.clone());
        }

        let mut state = self.write();
        if let Some(adapter) = state.adapters.get(&id) {
            return Ok(adapter.clone());
        }
        let bucket = state.buckets.get(&id).ok_or(ConfigError::UnknownBucket(id))?;
        let adapter = self.factory.create(bucket, &self.options)?;
        debug!("bucket_registry: created {} adapter for bucket {}", adapter.kind(), id);
        state.adapters.insert(id, adapter.clone());
        Ok(adapter)
    }

    /// Pin a bucket so it cannot be removed until the lease is dropped.
    pub fn lease(&self, id: BucketId) -> Result<BucketLease, ConfigError> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if !self.read().buckets.contains_key(&id) {
            return Err(ConfigError::UnknownBucket(id));
        }
        *leases.entry(id).or_insert(0) += 1;
        Ok(BucketLease {
            bucket_id: id,
            counts: self.leases.clone(),
        })
    }
}
