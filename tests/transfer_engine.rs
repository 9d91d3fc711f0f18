use async_trait::async_trait;
use bytes::Bytes;
use r2_uploader::{
    AdapterFactory, AppSettings, Bucket, BucketRegistry, ClientOptions, CompletedPart, ConfigError,
    EngineConfig, ListingPage, MultipartUploadHandle, ObjectBody, ProviderKind, RemoteObject,
    StorageAdapter, StorageError, StorageResult, TransferEngine, TransferRecord, TransferRegistry,
    TransferRequest, TransferSource, TransferStatus, Uploader, UrlService,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Put(String),
    Initiate(String),
    Part(u32),
    Complete(String, Vec<u32>),
    Abort(String),
}

#[derive(Default)]
struct MockAdapter {
    calls: Mutex<Vec<Call>>,
    uploads: AtomicUsize,
    /// Remaining transient failures per part number
    transient: Mutex<HashMap<u32, usize>>,
    /// Parts that fail permanently
    denied: HashSet<u32>,
    /// Part that waits for `release` before succeeding
    hold: Option<u32>,
    /// Key whose put waits for `release`
    hold_put: Option<&'static str>,
    /// The held put fails with a transient error once released
    fail_held_put: bool,
    release: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    objects: usize,
}

impl MockAdapter {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageAdapter for MockAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::R2
    }

    fn bucket_name(&self) -> &str {
        "mybucket"
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn put_object(&self, key: &str, _body: ObjectBody, _content_type: &str) -> StorageResult<()> {
        self.record(Call::Put(key.to_string()));
        self.enter();
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.hold_put == Some(key) {
            self.release.notified().await;
            if self.fail_held_put {
                self.leave();
                return Err(StorageError::transient("connection reset"));
            }
        }
        self.leave();
        Ok(())
    }

    async fn initiate_multipart(&self, key: &str, _content_type: &str) -> StorageResult<String> {
        self.record(Call::Initiate(key.to_string()));
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("upload-{}", n))
    }

    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<CompletedPart> {
        self.enter();
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.hold == Some(part_number) {
            self.release.notified().await;
        }
        self.leave();

        if self.denied.contains(&part_number) {
            return Err(StorageError::provider("AccessDenied", "Access Denied", Some(403)));
        }
        {
            let mut transient = self.transient.lock().unwrap();
            if let Some(left) = transient.get_mut(&part_number) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StorageError::transient("connection reset"));
                }
            }
        }
        assert!(!body.is_empty());
        self.record(Call::Part(part_number));
        Ok(CompletedPart {
            part_number,
            etag: format!("\"etag-{}\"", part_number),
        })
    }

    async fn complete_multipart(
        &self,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let numbers = parts.iter().map(|p| p.part_number).collect();
        self.record(Call::Complete(upload_id.to_string(), numbers));
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> StorageResult<()> {
        self.record(Call::Abort(upload_id.to_string()));
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
        page_size: u32,
    ) -> StorageResult<ListingPage<RemoteObject>> {
        let start: usize = continuation_token.map_or(0, |t| t.parse().unwrap());
        let end = (start + page_size as usize).min(self.objects);
        let items = (start..end)
            .map(|i| RemoteObject {
                key: format!("{}{}.txt", prefix.unwrap_or(""), i),
                size: i as u64,
                last_modified: 0,
                etag: String::new(),
            })
            .collect();
        Ok(ListingPage::new(items, end < self.objects, Some(end.to_string())))
    }

    async fn list_multipart_uploads(
        &self,
        _continuation_token: Option<&str>,
        _page_size: u32,
    ) -> StorageResult<ListingPage<MultipartUploadHandle>> {
        Ok(ListingPage::new(Vec::new(), false, None))
    }

    async fn delete_object(&self, _key: &str) -> StorageResult<()> {
        Ok(())
    }

    fn presigned_url(&self, key: &str, _ttl_secs: u64) -> StorageResult<String> {
        Ok(format!("https://signed.example/{}", key))
    }
}

struct MockFactory(Arc<MockAdapter>);

impl AdapterFactory for MockFactory {
    fn create(&self, _bucket: &Bucket, _options: &ClientOptions) -> Result<Arc<dyn StorageAdapter>, ConfigError> {
        Ok(self.0.clone())
    }
}

fn bucket(id: i64) -> Bucket {
    Bucket {
        id,
        kind: Some(ProviderKind::R2),
        bucket_name: "mybucket".to_string(),
        account_id: "abc123".to_string(),
        access_key: "AKIDEXAMPLE".to_string(),
        secret_key: "secret".to_string(),
        custom_domain: None,
        s3_api: None,
        endpoint: None,
        region: None,
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        retry_min_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..EngineConfig::default()
    }
}

fn uploader(adapter: Arc<MockAdapter>, config: EngineConfig) -> Uploader {
    Uploader::with_factory(
        config,
        AppSettings::default(),
        vec![bucket(1)],
        Arc::new(MockFactory(adapter)),
    )
    .unwrap()
}

fn blob(len: u64, filename: &str) -> TransferRequest {
    TransferRequest {
        source: TransferSource::Image {
            bytes: Bytes::from(vec![7u8; len as usize]),
            filename: filename.to_string(),
        },
        bucket_id: 1,
        remote_path: "uploads".to_string(),
    }
}

async fn wait_until<F: Fn(&TransferRecord) -> bool>(uploader: &Uploader, id: &str, done: F) -> TransferRecord {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(record) = uploader.transfers().get(id) {
                if done(&record) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("transfer did not reach the expected state")
}

async fn settled(uploader: &Uploader, id: &str) -> TransferRecord {
    wait_until(uploader, id, |r| r.status.is_terminal()).await
}

#[tokio::test]
async fn small_object_goes_through_single_put() {
    let adapter = Arc::new(MockAdapter::default());
    let uploader = uploader(adapter.clone(), config());

    let ids = uploader.submit(blob(1024, "cat.png")).await.unwrap();
    let record = settled(&uploader, &ids[0]).await;

    assert_eq!(record.status, TransferStatus::Success);
    assert_eq!(record.key, "uploads/cat.png");
    assert_eq!(record.url.as_deref(), Some("https://signed.example/uploads/cat.png"));
    assert_eq!(adapter.calls(), vec![Call::Put("uploads/cat.png".to_string())]);
}

#[tokio::test]
async fn transient_part_failures_are_retried_to_success() {
    let adapter = Arc::new(MockAdapter {
        transient: Mutex::new(HashMap::from([(2, 2)])),
        ..MockAdapter::default()
    });
    let uploader = uploader(adapter.clone(), config());
    let mut events = uploader.subscribe();

    let ids = uploader.submit(blob(20 * MIB, "video.mp4")).await.unwrap();
    let record = settled(&uploader, &ids[0]).await;
    assert_eq!(record.status, TransferStatus::Success);

    let calls = adapter.calls();
    let parts: Vec<_> = calls.iter().filter(|c| matches!(c, Call::Part(_))).collect();
    assert_eq!(parts.len(), 4);
    assert!(calls.contains(&Call::Complete("upload-1".to_string(), vec![1, 2, 3, 4])));
    assert!(!calls.iter().any(|c| matches!(c, Call::Abort(_))));

    // Progress never goes backwards and ends at the full size
    let mut last = 0;
    while let Ok(event) = events.try_recv() {
        if let Some(bytes) = event.status.bytes_uploaded() {
            assert!(bytes >= last, "bytes went from {} to {}", last, bytes);
            last = bytes;
        }
    }
    assert_eq!(last, 20 * MIB);
}

#[tokio::test]
async fn cancelling_mid_upload_aborts_the_multipart_upload() {
    let adapter = Arc::new(MockAdapter {
        hold: Some(3),
        ..MockAdapter::default()
    });
    let config = EngineConfig {
        part_concurrency: 1,
        ..config()
    };
    let uploader = uploader(adapter.clone(), config);

    let ids = uploader.submit(blob(20 * MIB, "video.mp4")).await.unwrap();
    wait_until(&uploader, &ids[0], |r| r.status.bytes_uploaded() == Some(10 * MIB)).await;

    // The bucket is pinned while the transfer runs
    assert_eq!(uploader.buckets().remove(1), Err(ConfigError::BucketInUse(1)));

    assert!(uploader.cancel(&ids[0]));
    adapter.release.notify_one();
    let record = settled(&uploader, &ids[0]).await;

    assert_eq!(record.status, TransferStatus::Cancelled);
    let calls = adapter.calls();
    assert!(calls.contains(&Call::Abort("upload-1".to_string())));
    assert!(!calls.iter().any(|c| matches!(c, Call::Complete(..))));
    assert!(!calls.contains(&Call::Part(4)));
    assert!(!uploader.cancel(&ids[0]));
}

#[tokio::test]
async fn permanent_failure_keeps_provider_code() {
    let adapter = Arc::new(MockAdapter {
        denied: HashSet::from([1]),
        ..MockAdapter::default()
    });
    let uploader = uploader(adapter.clone(), config());

    let ids = uploader.submit(blob(20 * MIB, "video.mp4")).await.unwrap();
    let record = settled(&uploader, &ids[0]).await;

    match record.status {
        TransferStatus::Error { code, message } => {
            assert_eq!(code, "AccessDenied");
            assert!(message.contains("Access Denied"));
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert!(adapter.calls().contains(&Call::Abort("upload-1".to_string())));
    assert!(record.url.is_none());
}

#[tokio::test]
async fn admission_cap_is_never_exceeded() {
    let adapter = Arc::new(MockAdapter::default());
    let config = EngineConfig {
        max_active_uploads: 2,
        part_concurrency: 4,
        ..config()
    };
    let uploader = uploader(adapter.clone(), config);

    let mut ids = Vec::new();
    for name in ["a.bin", "b.bin", "c.bin"] {
        ids.extend(uploader.submit(blob(20 * MIB, name)).await.unwrap());
    }
    ids.extend(uploader.submit(blob(10, "d.txt")).await.unwrap());

    for id in &ids {
        assert_eq!(settled(&uploader, id).await.status, TransferStatus::Success);
    }
    assert!(adapter.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn shutdown_settles_every_transfer() {
    let adapter = Arc::new(MockAdapter {
        hold: Some(1),
        ..MockAdapter::default()
    });
    let uploader = uploader(adapter.clone(), config());

    let ids = uploader.submit(blob(20 * MIB, "video.mp4")).await.unwrap();
    wait_until(&uploader, &ids[0], |r| matches!(r.status, TransferStatus::Uploading { .. })).await;

    let shutdown = uploader.shutdown();
    adapter.release.notify_one();
    shutdown.await;

    let record = uploader.transfers().get(&ids[0]).unwrap();
    assert_eq!(record.status, TransferStatus::Cancelled);
    assert!(adapter.calls().contains(&Call::Abort("upload-1".to_string())));
}

#[tokio::test]
async fn catalog_pages_respect_requested_size() {
    let adapter = Arc::new(MockAdapter {
        objects: 7,
        ..MockAdapter::default()
    });
    let uploader = uploader(adapter, config());
    let catalog = uploader.catalog();

    assert_eq!(catalog.page_size(Some(0)), 1);
    assert_eq!(catalog.page_size(Some(50_000)), 1_000);
    assert_eq!(catalog.page_size(None), 50);

    let mut token = None;
    let mut keys = Vec::new();
    loop {
        let page = catalog
            .list_objects(1, Some("docs/"), token.as_deref(), Some(3))
            .await
            .unwrap();
        assert!(page.items.len() <= 3);
        assert_eq!(page.is_truncated, page.continuation_token.is_some());
        keys.extend(page.items.into_iter().map(|o| o.key));
        match page.continuation_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    assert_eq!(keys.len(), 7);
    assert_eq!(keys[0], "docs/0.txt");

    let first = catalog.list_objects(1, Some("docs/"), None, Some(3)).await.unwrap();
    let token = first.continuation_token.unwrap();
    assert!(matches!(
        catalog.list_objects(1, Some("other/"), Some(&token), Some(3)).await,
        Err(StorageError::Validation(_))
    ));
}

#[tokio::test]
async fn unknown_bucket_registers_nothing() {
    let adapter = Arc::new(MockAdapter::default());
    let uploader = uploader(adapter, config());

    let mut request = blob(10, "a.txt");
    request.bucket_id = 99;
    assert!(matches!(
        uploader.submit(request).await,
        Err(StorageError::Config(ConfigError::UnknownBucket(99)))
    ));
    assert!(uploader.transfers().is_empty());
}

#[tokio::test]
async fn cancel_during_a_failing_request_ends_cancelled() {
    let adapter = Arc::new(MockAdapter {
        hold_put: Some("uploads/note.txt"),
        fail_held_put: true,
        ..MockAdapter::default()
    });
    let config = EngineConfig {
        retry_min_delay_ms: 1_000,
        retry_max_delay_ms: 5_000,
        ..config()
    };
    let uploader = uploader(adapter.clone(), config);

    let ids = uploader.submit(blob(10, "note.txt")).await.unwrap();
    wait_until(&uploader, &ids[0], |r| matches!(r.status, TransferStatus::Uploading { .. })).await;

    assert!(uploader.cancel(&ids[0]));
    adapter.release.notify_one();
    let record = settled(&uploader, &ids[0]).await;

    assert_eq!(record.status, TransferStatus::Cancelled);
    assert!(record.url.is_none());
    assert_eq!(adapter.calls(), vec![Call::Put("uploads/note.txt".to_string())]);
}

#[tokio::test]
async fn queued_transfer_can_be_cancelled_before_admission() {
    let adapter = Arc::new(MockAdapter {
        hold_put: Some("uploads/first.bin"),
        ..MockAdapter::default()
    });
    let config = EngineConfig {
        max_active_uploads: 1,
        ..config()
    };
    let uploader = uploader(adapter.clone(), config);

    let first = uploader.submit(blob(10, "first.bin")).await.unwrap();
    wait_until(&uploader, &first[0], |r| matches!(r.status, TransferStatus::Uploading { .. })).await;
    let queued = uploader.submit(blob(10, "second.bin")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(uploader.transfers().get(&queued[0]).unwrap().status, TransferStatus::Waiting);

    assert!(uploader.cancel(&queued[0]));
    assert_eq!(settled(&uploader, &queued[0]).await.status, TransferStatus::Cancelled);
    assert!(matches!(
        uploader.transfers().get(&first[0]).unwrap().status,
        TransferStatus::Uploading { .. }
    ));

    adapter.release.notify_one();
    assert_eq!(settled(&uploader, &first[0]).await.status, TransferStatus::Success);
    assert_eq!(adapter.calls(), vec![Call::Put("uploads/first.bin".to_string())]);
}

#[tokio::test]
async fn admission_follows_submission_order() {
    let adapter = Arc::new(MockAdapter {
        hold_put: Some("uploads/first.bin"),
        ..MockAdapter::default()
    });
    let config = EngineConfig {
        max_active_uploads: 1,
        ..config()
    };
    let uploader = uploader(adapter.clone(), config);

    let mut ids = uploader.submit(blob(10, "first.bin")).await.unwrap();
    wait_until(&uploader, &ids[0], |r| matches!(r.status, TransferStatus::Uploading { .. })).await;
    let names = ["a.bin", "b.bin", "c.bin", "d.bin"];
    for name in names {
        ids.extend(uploader.submit(blob(10, name)).await.unwrap());
    }

    adapter.release.notify_one();
    for id in &ids {
        assert_eq!(settled(&uploader, id).await.status, TransferStatus::Success);
    }

    let order: Vec<Call> = std::iter::once("first.bin")
        .chain(names)
        .map(|name| Call::Put(format!("uploads/{}", name)))
        .collect();
    assert_eq!(adapter.calls(), order);
    assert_eq!(adapter.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn engine_rejects_zero_part_size() {
    let adapter = Arc::new(MockAdapter::default());
    let buckets = Arc::new(BucketRegistry::with_factory(
        vec![bucket(1)],
        &AppSettings::default(),
        ClientOptions::default(),
        Arc::new(MockFactory(adapter.clone())),
    ));
    let urls = Arc::new(UrlService::new(buckets.clone(), 3600));
    let config = EngineConfig {
        part_size: 0,
        min_part_size: 0,
        ..config()
    };

    let engine = TransferEngine::new(
        config.clone(),
        buckets,
        Arc::new(TransferRegistry::new()),
        urls,
        None,
    );
    assert!(matches!(engine, Err(ConfigError::InvalidSetting(_))));

    let built = Uploader::with_factory(
        config,
        AppSettings::default(),
        vec![bucket(1)],
        Arc::new(MockFactory(adapter)),
    );
    assert!(matches!(built, Err(ConfigError::InvalidSetting(_))));
}
