//! Repository layer for data access operations.
//!
//! `JobStore` and `BucketStore` are the seams the dispatcher and the rate
//! limiters depend on. Postgres implementations back production; the
//! in-memory ones back tests and the `memory` store backend.

mod bucket_repo;
mod job_repo;
mod memory;

pub use bucket_repo::BucketRepository;
pub use job_repo::JobRepository;
pub use memory::{MemoryBucketStore, MemoryJobStore};

use async_trait::async_trait;
use jiff::Timestamp;
use uuid::Uuid;

use crate::error::AppResult;
use crate::jobs::models::{DeadLetterEntry, Job, JobPatch, JobStats, NewJob};
use crate::jobs::types::JobStatus;
use crate::ratelimit::BucketRecord;

/// Durable job queue and dead letter storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> AppResult<Job>;

    /// Atomically moves the best due PENDING job to RUNNING.
    ///
    /// Best means highest priority, then earliest `scheduled_for`, then
    /// oldest. Two concurrent callers never receive the same job.
    async fn claim_next(&self, now: Timestamp) -> AppResult<Option<Job>>;

    async fn get(&self, id: Uuid) -> AppResult<Job>;

    /// Applies `patch` only if the job is still in `expected` status.
    ///
    /// Fails with `AppError::InvalidTransition` when the status differs.
    async fn update_job(&self, id: Uuid, expected: JobStatus, patch: JobPatch) -> AppResult<Job>;

    /// Marks a RUNNING job failed and records its dead letter in one step.
    async fn dead_letter(&self, id: Uuid, patch: JobPatch, entry: DeadLetterEntry)
    -> AppResult<()>;

    /// RUNNING jobs started before `cutoff`.
    async fn list_stale(&self, cutoff: Timestamp) -> AppResult<Vec<Job>>;

    async fn stats(&self) -> AppResult<JobStats>;

    /// Newest first.
    async fn list_dead_letters(
        &self,
        unresolved_only: bool,
        limit: i64,
    ) -> AppResult<Vec<DeadLetterEntry>>;

    async fn resolve_dead_letter(&self, id: Uuid, notes: String) -> AppResult<DeadLetterEntry>;

    /// Applies `patch` to a job still in `expected` status and resolves its
    /// open dead letters in one step. Returns the job and how many dead
    /// letters changed.
    async fn retry_job(
        &self,
        id: Uuid,
        expected: JobStatus,
        patch: JobPatch,
        notes: String,
    ) -> AppResult<(Job, usize)>;
}

/// Persisted rate limit bucket state.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn load(&self, name: &str) -> AppResult<Option<BucketRecord>>;

    /// Insert or overwrite.
    async fn save(&self, record: BucketRecord) -> AppResult<()>;

    async fn list(&self) -> AppResult<Vec<BucketRecord>>;
}
