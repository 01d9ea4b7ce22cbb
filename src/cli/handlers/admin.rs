//! Admin command handlers
//!
//! One-shot operations against the job store: enqueue, retry, cancel,
//! stats, dead letter listing and resolution, and persisted bucket state.

use std::time::Duration;

use jiff::Timestamp;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::settings::Settings;
use crate::error::{AppError, AppResult};
use crate::jobs::{CancelOutcome, DeadLetterEntry, JobQueue, JobStats, JobType};
use crate::ratelimit::BucketRecord;
use crate::state::Stores;

/// Handler for the admin commands
pub struct AdminCommandHandler {
    stores: Stores,
    queue: JobQueue,
}

impl AdminCommandHandler {
    /// Connect to the configured store
    pub async fn connect(config: &Settings) -> AppResult<Self> {
        let stores = Stores::connect(config).await?;
        Ok(Self::with_stores(config, stores))
    }

    pub fn with_stores(config: &Settings, stores: Stores) -> Self {
        let queue = stores.admin_queue(config);
        Self { stores, queue }
    }

    pub async fn enqueue(
        &self,
        job_type: JobType,
        input: JsonValue,
        priority: i16,
        delay_secs: Option<u64>,
        max_attempts: Option<i32>,
    ) -> AppResult<Uuid> {
        let scheduled_for = delay_secs
            .map(|secs| {
                Timestamp::now()
                    .checked_add(Duration::from_secs(secs))
                    .map_err(|e| AppError::validation("delay_secs", e.to_string()))
            })
            .transpose()?;

        let id = self
            .queue
            .enqueue(job_type, input, priority, scheduled_for, max_attempts)
            .await?;
        println!("✓ Enqueued {} job {}", job_type, id);
        Ok(id)
    }

    pub async fn retry(&self, id: Uuid) -> AppResult<()> {
        let job = self.queue.retry(id).await?;
        println!(
            "✓ Job {} is pending again ({} attempts allowed, due {})",
            job.id, job.max_attempts, job.scheduled_for
        );
        Ok(())
    }

    pub async fn cancel(&self, id: Uuid) -> AppResult<CancelOutcome> {
        let outcome = self.queue.cancel(id).await?;
        match outcome {
            CancelOutcome::Cancelled => println!("✓ Job {} cancelled", id),
            CancelOutcome::Signalled => println!("✓ Cancellation signalled to job {}", id),
        }
        Ok(outcome)
    }

    pub async fn stats(&self) -> AppResult<JobStats> {
        let stats = self.queue.stats().await?;
        println!("pending:    {}", stats.pending);
        println!("running:    {}", stats.running);
        println!("succeeded:  {}", stats.succeeded);
        println!("failed:     {}", stats.failed);
        println!("cancelled:  {}", stats.cancelled);
        println!("total:      {}", stats.total());
        println!("unresolved dead letters: {}", stats.unresolved_dead_letters);
        Ok(stats)
    }

    pub async fn dead_letters(&self, all: bool, limit: i64) -> AppResult<Vec<DeadLetterEntry>> {
        let entries = self.queue.dead_letters(!all, limit).await?;
        if entries.is_empty() {
            println!("No dead letters");
        }
        for entry in &entries {
            let state = match (&entry.resolved_at, &entry.resolution_notes) {
                (Some(at), Some(notes)) => format!("resolved {} ({})", at, notes),
                (Some(at), None) => format!("resolved {}", at),
                (None, _) => "open".to_string(),
            };
            println!(
                "{}  job={} type={} attempts={} failed_at={} {}\n    {}",
                entry.id,
                entry.job_id,
                entry.job_type,
                entry.attempts,
                entry.failed_at,
                state,
                entry.last_error
            );
        }
        Ok(entries)
    }

    pub async fn resolve(&self, id: Uuid, notes: String) -> AppResult<()> {
        let entry = self.queue.resolve(id, notes).await?;
        println!("✓ Dead letter {} for job {} resolved", entry.id, entry.job_id);
        Ok(())
    }

    pub async fn buckets(&self) -> AppResult<Vec<BucketRecord>> {
        let buckets = self.stores.buckets.list().await?;
        if buckets.is_empty() {
            println!("No persisted buckets");
        }
        for bucket in &buckets {
            println!(
                "{:<16} tokens={:.2} last_refill={}",
                bucket.name, bucket.tokens, bucket.last_refill_time
            );
        }
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::jobs::{JobPatch, JobStatus};

    fn handler() -> AdminCommandHandler {
        AdminCommandHandler::with_stores(&Settings::default(), Stores::memory())
    }

    #[tokio::test]
    async fn test_enqueue_with_delay() {
        let handler = handler();
        let before = Timestamp::now();

        let id = handler
            .enqueue(JobType::PricePublish, json!({"sku": "A-1"}), 8, Some(60), Some(3))
            .await
            .unwrap();

        let job = handler.stores.jobs.get(id).await.unwrap();
        assert_eq!(job.priority, 8);
        assert_eq!(job.max_attempts, 3);
        assert!(job.scheduled_for >= before.checked_add(Duration::from_secs(60)).unwrap());
    }

    #[tokio::test]
    async fn test_cancel_and_retry() {
        let handler = handler();
        let id = handler
            .enqueue(JobType::CatalogSync, json!({}), 5, None, None)
            .await
            .unwrap();

        assert_eq!(handler.cancel(id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(handler.stats().await.unwrap().cancelled, 1);

        handler.retry(id).await.unwrap();
        let job = handler.stores.jobs.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_of_pending_job_fails() {
        let handler = handler();
        let id = handler
            .enqueue(JobType::CatalogSync, json!({}), 5, None, None)
            .await
            .unwrap();

        let err = handler.retry(id).await.unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[tokio::test]
    async fn test_dead_letters_and_resolve() {
        let handler = handler();
        let id = handler
            .enqueue(JobType::FeatureCompute, json!({"window": "1h"}), 5, None, None)
            .await
            .unwrap();
        let job = handler.stores.jobs.claim_next(Timestamp::now()).await.unwrap().unwrap();
        let now = Timestamp::now();
        handler
            .stores
            .jobs
            .dead_letter(
                id,
                JobPatch::failed(1, "bad input".to_string(), now),
                DeadLetterEntry::for_job(&job, 1, "bad input".to_string(), now),
            )
            .await
            .unwrap();

        let open = handler.dead_letters(false, 20).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].job_id, id);

        handler
            .resolve(open[0].id, "input fixed upstream".to_string())
            .await
            .unwrap();
        assert!(handler.dead_letters(false, 20).await.unwrap().is_empty());
        assert_eq!(handler.dead_letters(true, 20).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_buckets_lists_saved_rows() {
        let handler = handler();
        assert!(handler.buckets().await.unwrap().is_empty());

        handler
            .stores
            .buckets
            .save(BucketRecord {
                name: "catalog".to_string(),
                tokens: 12.5,
                last_refill_time: Timestamp::now(),
            })
            .await
            .unwrap();

        let buckets = handler.buckets().await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "catalog");
    }
}
