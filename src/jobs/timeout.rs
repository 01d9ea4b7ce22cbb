use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::jobs::error::JobError;
use crate::jobs::types::JobType;

/// Runs `operation` with a deadline.
///
/// The operation gets a child of `cancel`. When `limit` elapses first the
/// child token is cancelled and `Timeout` is returned right away, without
/// waiting for the operation to notice. Cancelling `cancel` itself yields
/// `Cancelled`.
pub async fn with_timeout<F, Fut, T>(
    operation: F,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<T, JobError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, JobError>>,
{
    let child = cancel.child_token();
    let fut = operation(child.clone());

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled),
        result = fut => result,
        _ = tokio::time::sleep(limit) => {
            child.cancel();
            debug!(limit_ms = limit.as_millis() as u64, "Operation timed out");
            Err(JobError::Timeout { limit })
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

/// Per-job-type execution limits, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimeouts {
    #[serde(default = "default_timeout_secs")]
    pub default_secs: u64,
    #[serde(default)]
    pub price_publish_secs: Option<u64>,
    #[serde(default)]
    pub catalog_sync_secs: Option<u64>,
    #[serde(default)]
    pub market_data_sync_secs: Option<u64>,
    #[serde(default)]
    pub feature_compute_secs: Option<u64>,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            default_secs: default_timeout_secs(),
            price_publish_secs: Some(60),
            catalog_sync_secs: Some(600),
            market_data_sync_secs: Some(300),
            feature_compute_secs: Some(900),
        }
    }
}

impl JobTimeouts {
    pub fn for_job(&self, job_type: JobType) -> Duration {
        let secs = match job_type {
            JobType::PricePublish => self.price_publish_secs,
            JobType::CatalogSync => self.catalog_sync_secs,
            JobType::MarketDataSync => self.market_data_sync_secs,
            JobType::FeatureCompute => self.feature_compute_secs,
        };
        Duration::from_secs(secs.unwrap_or(self.default_secs))
    }

    /// Longest limit across every job type.
    pub fn longest(&self) -> Duration {
        JobType::ALL
            .iter()
            .map(|t| self.for_job(*t))
            .max()
            .unwrap_or(Duration::from_secs(self.default_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_times_out_and_cancels_operation() {
        let cancel = CancellationToken::new();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let start = Instant::now();

        let result: Result<(), JobError> = with_timeout(
            |token| async move {
                tokio::spawn(async move {
                    token.cancelled().await;
                    let _ = seen_tx.send(());
                });
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(())
            },
            Duration::from_millis(1000),
            &cancel,
        )
        .await;

        assert_eq!(
            result,
            Err(JobError::Timeout {
                limit: Duration::from_millis(1000)
            })
        );
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        seen_rx.await.unwrap();
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_limit() {
        let cancel = CancellationToken::new();
        let result = with_timeout(
            |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(7)
            },
            Duration::from_secs(1),
            &cancel,
        )
        .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_wins() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result: Result<(), JobError> = with_timeout(
            |token| async move {
                token.cancelled().await;
                Err(JobError::transient("aborted"))
            },
            Duration::from_secs(10),
            &cancel,
        )
        .await;
        assert_eq!(result, Err(JobError::Cancelled));
    }

    #[test]
    fn test_timeout_lookup_falls_back_to_default() {
        let timeouts = JobTimeouts {
            default_secs: 42,
            price_publish_secs: Some(5),
            catalog_sync_secs: None,
            market_data_sync_secs: None,
            feature_compute_secs: None,
        };
        assert_eq!(timeouts.for_job(JobType::PricePublish), Duration::from_secs(5));
        assert_eq!(timeouts.for_job(JobType::CatalogSync), Duration::from_secs(42));
        assert_eq!(timeouts.longest(), Duration::from_secs(42));
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = JobTimeouts::default();
        assert_eq!(timeouts.for_job(JobType::FeatureCompute), Duration::from_secs(900));
        assert_eq!(timeouts.longest(), Duration::from_secs(900));
    }
}
