//! Per-transfer worker: single put or multipart, with progress and abort

use super::plan::{plan_upload, PartRange, UploadPlan};
use super::progress::SpeedMeter;
use super::retry::{with_retry, RetryPolicy};
use super::source::{Payload, UploadItem};
use super::state::TransferRegistry;
use super::types::{TransferId, TransferStatus};
use crate::bucket::BucketId;
use crate::buckets::BucketLease;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::{StorageError, StorageResult};
use crate::providers::{validate_completion, CompletedPart, StorageAdapter};
use crate::url::UrlService;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Shared by every worker of one engine.
pub(crate) struct WorkerContext {
    pub registry: Arc<TransferRegistry>,
    pub urls: Arc<UrlService>,
    pub config: EngineConfig,
    pub retry: RetryPolicy,
    /// Global cap on simultaneously running put/part uploads
    pub admission: Arc<Semaphore>,
    pub history: Option<Arc<Database>>,
}

pub(crate) struct TransferTask {
    pub id: TransferId,
    pub bucket_id: BucketId,
    pub item: UploadItem,
    pub adapter: Arc<dyn StorageAdapter>,
    pub cancel: CancellationToken,
    pub lease: BucketLease,
}

/// Drive one transfer to a terminal status.
pub(crate) async fn run_transfer(ctx: Arc<WorkerContext>, task: TransferTask) {
    let outcome = if task.cancel.is_cancelled() {
        Err(StorageError::Cancelled)
    } else {
        execute(&ctx, &task).await
    };

    let status = match outcome {
        Ok(()) => {
            match ctx.urls.url_for(task.bucket_id, &task.item.key) {
                Ok(url) => {
                    ctx.registry.set_url(&task.id, url);
                }
                Err(e) => warn!("transfer_url: {} could not build URL: {}", task.id, e),
            }
            TransferStatus::Success
        }
        Err(StorageError::Cancelled) => TransferStatus::Cancelled,
        // A request that failed after the user cancelled is still a cancellation.
        Err(e) if task.cancel.is_cancelled() => {
            debug!("transfer_status: {} failed after cancel: {}", task.id, e);
            TransferStatus::Cancelled
        }
        Err(e) => TransferStatus::Error {
            message: e.to_string(),
            code: e.code(),
        },
    };

    if let Err(rejected) = ctx.registry.update_status(&task.id, status) {
        warn!("transfer_status: {} final update rejected: {:?}", task.id, rejected);
    }

    if let Some(db) = &ctx.history {
        if let Some(record) = ctx.registry.get(&task.id) {
            if let Err(e) = db.save_transfer(&record).await {
                warn!("transfer_history: failed to persist {}: {}", task.id, e);
            }
        }
    }
    drop(task.lease);
}

async fn execute(ctx: &WorkerContext, task: &TransferTask) -> StorageResult<()> {
    match plan_upload(task.item.size, &ctx.config)? {
        UploadPlan::Single => upload_single(ctx, task).await,
        UploadPlan::Multipart { part_size, parts } => {
            debug!(
                "transfer_plan: {} size={} part_size={} parts={}",
                task.id,
                task.item.size,
                part_size,
                parts.len()
            );
            upload_multipart(ctx, task, parts).await
        }
    }
}

/// Wait for a slot in the global upload budget, or for cancellation.
async fn admit(admission: &Arc<Semaphore>, cancel: &CancellationToken) -> StorageResult<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        permit = admission.clone().acquire_owned() => permit.map_err(|_| StorageError::Cancelled),
    }
}

fn report(ctx: &WorkerContext, id: &str, uploaded: u64, total: u64, speed: f64) {
    if let Err(rejected) = ctx
        .registry
        .update_status(id, TransferStatus::uploading(uploaded, total, speed))
    {
        debug!("transfer_progress: {} ignored: {:?}", id, rejected);
    }
}

async fn upload_single(ctx: &WorkerContext, task: &TransferTask) -> StorageResult<()> {
    let _permit = admit(&ctx.admission, &task.cancel).await?;
    let item = &task.item;
    let mut meter = SpeedMeter::new(ctx.config.speed_window());
    report(ctx, &task.id, 0, item.size, 0.0);

    with_retry(&ctx.retry, &task.cancel, "PutObject", || {
        task.adapter.put_object(&item.key, item.body(), &item.content_type)
    })
    .await?;

    let speed = meter.record(item.size);
    report(ctx, &task.id, item.size, item.size, speed);
    info!("transfer_uploaded: {} key={} bytes={}", task.id, item.key, item.size);
    Ok(())
}

async fn upload_multipart(
    ctx: &WorkerContext,
    task: &TransferTask,
    parts: Vec<PartRange>,
) -> StorageResult<()> {
    let item = &task.item;
    let expected = parts.len();

    // Hold a slot before opening the upload so queued transfers don't
    // leave idle multipart uploads behind.
    let first_permit = admit(&ctx.admission, &task.cancel).await?;
    let upload_id = with_retry(&ctx.retry, &task.cancel, "CreateMultipartUpload", || {
        task.adapter.initiate_multipart(&item.key, &item.content_type)
    })
    .await?;
    info!(
        "multipart_started: {} key={} upload_id={} parts={}",
        task.id, item.key, upload_id, expected
    );

    let result = match upload_parts(ctx, task, &upload_id, parts, first_permit).await {
        Ok(completed) if task.cancel.is_cancelled() => {
            debug!("multipart_cancelled: {} after {} parts", task.id, completed.len());
            Err(StorageError::Cancelled)
        }
        Ok(completed) => complete(ctx, task, &upload_id, &completed, expected).await,
        Err(err) => Err(err),
    };

    if let Err(err) = &result {
        debug!("multipart_failed: {} {}", task.id, err);
        abort_upload(task, &upload_id).await;
    }
    result
}

async fn complete(
    ctx: &WorkerContext,
    task: &TransferTask,
    upload_id: &str,
    completed: &[CompletedPart],
    expected: usize,
) -> StorageResult<()> {
    validate_completion(completed)?;
    if completed.len() != expected || completed.last().map(|p| p.part_number as usize) != Some(expected) {
        return Err(StorageError::Validation(format!(
            "{} of {} parts recorded for completion",
            completed.len(),
            expected
        )));
    }

    with_retry(&ctx.retry, &task.cancel, "CompleteMultipartUpload", || {
        task.adapter.complete_multipart(&task.item.key, upload_id, completed)
    })
    .await?;
    info!(
        "multipart_completed: {} key={} upload_id={}",
        task.id, task.item.key, upload_id
    );
    Ok(())
}

/// Upload every part with at most `part_concurrency` in flight. After a
/// permanent failure or cancellation nothing new is scheduled, in-flight
/// parts are drained, and the first error is returned.
async fn upload_parts(
    ctx: &WorkerContext,
    task: &TransferTask,
    upload_id: &str,
    parts: Vec<PartRange>,
    first_permit: OwnedSemaphorePermit,
) -> StorageResult<Vec<CompletedPart>> {
    let total = task.item.size;
    let part_limit = ctx.config.part_concurrency.max(1);
    let mut meter = SpeedMeter::new(ctx.config.speed_window());
    let mut pending = parts.into_iter();
    let mut first_permit = Some(first_permit);
    let mut in_flight = JoinSet::new();
    let mut completed = Vec::new();
    let mut uploaded = 0u64;
    let mut failure: Option<StorageError> = None;

    report(ctx, &task.id, 0, total, 0.0);

    loop {
        while failure.is_none() && !task.cancel.is_cancelled() && in_flight.len() < part_limit {
            let Some(range) = pending.next() else { break };
            let permit = match first_permit.take() {
                Some(permit) => permit,
                None => match admit(&ctx.admission, &task.cancel).await {
                    Ok(permit) => permit,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                },
            };
            in_flight.spawn(upload_one_part(
                task.adapter.clone(),
                task.item.payload.clone(),
                task.item.key.clone(),
                upload_id.to_string(),
                range,
                ctx.retry.clone(),
                task.cancel.clone(),
                permit,
            ));
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        match joined {
            Ok(Ok((part, len))) => {
                uploaded += len;
                debug!("part_uploaded: {} #{} {}/{}", task.id, part.part_number, uploaded, total);
                completed.push(part);
                let speed = meter.record(uploaded);
                report(ctx, &task.id, uploaded, total, speed);
            }
            Ok(Err(err)) => {
                if failure.is_none() {
                    if !matches!(err, StorageError::Cancelled) {
                        warn!("part_failed: {} {}", task.id, err);
                    }
                    failure = Some(err);
                }
            }
            Err(join_err) => {
                failure.get_or_insert(StorageError::provider(
                    "InternalError",
                    format!("part task failed: {}", join_err),
                    None,
                ));
            }
        }
    }

    if task.cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    if let Some(err) = failure {
        return Err(err);
    }
    completed.sort_by_key(|part| part.part_number);
    Ok(completed)
}

#[allow(clippy::too_many_arguments)]
async fn upload_one_part(
    adapter: Arc<dyn StorageAdapter>,
    payload: Payload,
    key: String,
    upload_id: String,
    range: PartRange,
    retry: RetryPolicy,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) -> StorageResult<(CompletedPart, u64)> {
    let _permit = permit;
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    let body = payload.read_part(&range).await?;
    let label = format!("UploadPart #{}", range.number);
    let part = with_retry(&retry, &cancel, &label, || {
        adapter.upload_part(&key, &upload_id, range.number, body.clone())
    })
    .await?;
    Ok((part, range.len))
}

/// Best effort; a failed abort leaves an orphaned upload the catalog can
/// still list and abort.
async fn abort_upload(task: &TransferTask, upload_id: &str) {
    match task.adapter.abort_multipart(&task.item.key, upload_id).await {
        Ok(()) => info!("multipart_aborted: {} upload_id={}", task.id, upload_id),
        Err(e) => warn!(
            "multipart_abort_failed: {} upload_id={} {}",
            task.id, upload_id, e
        ),
    }
}
