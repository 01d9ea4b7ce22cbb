//! Enqueue and admin operations on the job queue.

use std::sync::Arc;

use jiff::Timestamp;
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::jobs::dispatcher::InFlightJobs;
use crate::jobs::models::{DeadLetterEntry, Job, JobPatch, JobStats, NewJob};
use crate::jobs::types::{JobStatus, JobType};
use crate::repositories::JobStore;

/// Attempts at a cancel that keeps losing races with the dispatcher.
const CANCEL_ATTEMPTS: usize = 3;

/// How a cancel request took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job is now CANCELLED.
    Cancelled,
    /// The job is executing in this process; its token was signalled and
    /// the dispatcher will record the cancellation.
    Signalled,
}

/// Job queue facade used by producers and operators.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    in_flight: InFlightJobs,
    default_max_attempts: i32,
}

impl JobQueue {
    /// Creates a new JobQueue sharing the dispatcher's in-flight table.
    pub fn new(store: Arc<dyn JobStore>, in_flight: InFlightJobs, default_max_attempts: i32) -> Self {
        Self {
            store,
            in_flight,
            default_max_attempts,
        }
    }

    /// Enqueues a job and returns its id.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        input: JsonValue,
        priority: i16,
        scheduled_for: Option<Timestamp>,
        max_attempts: Option<i32>,
    ) -> AppResult<Uuid> {
        let mut new_job = NewJob::new(job_type, input)
            .with_priority(priority)
            .with_max_attempts(max_attempts.unwrap_or(self.default_max_attempts));
        if let Some(at) = scheduled_for {
            new_job = new_job.scheduled_for(at);
        }
        self.submit(new_job).await.map(|job| job.id)
    }

    /// Validates and stores a prepared job request.
    pub async fn submit(&self, new_job: NewJob) -> AppResult<Job> {
        new_job.validate()?;
        let job = self.store.enqueue(new_job).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            scheduled_for = %job.scheduled_for,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Gets a job by ID.
    pub async fn get(&self, id: Uuid) -> AppResult<Job> {
        self.store.get(id).await
    }

    /// Puts a FAILED or CANCELLED job back to PENDING with a fresh attempt
    /// budget and resolves its open dead letters.
    pub async fn retry(&self, id: Uuid) -> AppResult<Job> {
        let job = self.store.get(id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(AppError::InvalidTransition {
                id: id.to_string(),
                expected: "failed or cancelled".to_string(),
                actual: job.status.to_string(),
            });
        }

        let scheduled_for = job.scheduled_for.max(Timestamp::now());
        let (job, resolved) = self
            .store
            .retry_job(
                id,
                job.status,
                JobPatch::reset_for_retry(scheduled_for),
                "manually retried".to_string(),
            )
            .await?;

        info!(job_id = %id, job_type = %job.job_type, resolved, "Job manually retried");
        Ok(job)
    }

    /// Cancels a PENDING or RUNNING job.
    pub async fn cancel(&self, id: Uuid) -> AppResult<CancelOutcome> {
        let mut last_error = None;

        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.store.get(id).await?;
            let result = match job.status {
                JobStatus::Pending => self.cancel_directly(id, JobStatus::Pending).await,
                JobStatus::Running => {
                    if let Some(token) = self.in_flight.get(&id) {
                        token.cancel();
                        info!(job_id = %id, "Cancellation signalled to running job");
                        return Ok(CancelOutcome::Signalled);
                    }
                    self.cancel_directly(id, JobStatus::Running).await
                }
                status => {
                    return Err(AppError::InvalidTransition {
                        id: id.to_string(),
                        expected: "pending or running".to_string(),
                        actual: status.to_string(),
                    });
                }
            };

            match result {
                Err(e) if e.is_invalid_transition() => last_error = Some(e),
                other => return other,
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::job_not_found(id)))
    }

    async fn cancel_directly(&self, id: Uuid, from: JobStatus) -> AppResult<CancelOutcome> {
        self.store
            .update_job(id, from, JobPatch::cancelled(Timestamp::now()))
            .await?;
        info!(job_id = %id, from = %from, "Job cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    pub async fn stats(&self) -> AppResult<JobStats> {
        self.store.stats().await
    }

    pub async fn dead_letters(
        &self,
        unresolved_only: bool,
        limit: i64,
    ) -> AppResult<Vec<DeadLetterEntry>> {
        self.store.list_dead_letters(unresolved_only, limit).await
    }

    /// Marks a dead letter as handled.
    pub async fn resolve(&self, id: Uuid, notes: String) -> AppResult<DeadLetterEntry> {
        let entry = self.store.resolve_dead_letter(id, notes).await?;
        info!(dead_letter_id = %id, job_id = %entry.job_id, "Dead letter resolved");
        Ok(entry)
    }
}
