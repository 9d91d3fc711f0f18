//! Exponential backoff for transient provider failures

use crate::config::EngineConfig;
use crate::error::{StorageError, StorageResult};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            min_delay: Duration::from_millis(config.retry_min_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Run `op`, retrying only transient errors and only while `cancel` has not
/// fired. Everything else is returned on the first failure. A backoff sleep
/// ends early on cancellation, and a transient failure that outlives the
/// token is reported as [`StorageError::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    op: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let sleep_cancel = cancel.clone();
    let result = op
        .retry(policy.backoff())
        .sleep(move |dur: Duration| {
            let cancel = sleep_cancel.clone();
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(dur) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        })
        .when(|err: &StorageError| err.is_transient() && !cancel.is_cancelled())
        .notify(|err: &StorageError, dur: Duration| {
            log::warn!("retry: {} in {:?} after {}", label, dur, err);
        })
        .await;

    match result {
        Err(err) if err.is_transient() && cancel.is_cancelled() => Err(StorageError::Cancelled),
        other => other,
    }
}
