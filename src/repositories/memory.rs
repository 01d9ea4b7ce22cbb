//! In-memory stores.
//!
//! One mutex guards all state, so claims are serialized and the
//! status-change-plus-dead-letter write is atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use jiff::Timestamp;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::jobs::models::{DeadLetterEntry, Job, JobPatch, JobStats, NewJob};
use crate::jobs::types::JobStatus;
use crate::ratelimit::BucketRecord;
use crate::repositories::{BucketStore, JobStore};

fn lock_error<T>(_: std::sync::PoisonError<T>) -> AppError {
    AppError::Internal {
        source: anyhow::anyhow!("memory store lock poisoned"),
    }
}

#[derive(Debug, Default)]
struct JobState {
    jobs: HashMap<Uuid, Job>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl JobState {
    fn job_mut(&mut self, id: Uuid, expected: JobStatus) -> AppResult<&mut Job> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::job_not_found(id))?;
        if job.status != expected {
            return Err(AppError::InvalidTransition {
                id: id.to_string(),
                expected: expected.to_string(),
                actual: job.status.to_string(),
            });
        }
        Ok(job)
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<JobState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, JobState>> {
        self.state.lock().map_err(lock_error)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> AppResult<Job> {
        let job = job.into_job(Timestamp::now());
        self.lock()?.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(&self, now: Timestamp) -> AppResult<Option<Job>> {
        let mut state = self.lock()?;

        let next = state
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_for.cmp(&b.scheduled_for))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let job = state.job_mut(id, JobStatus::Pending)?;
        JobPatch::running(now).apply(job, now);
        Ok(Some(job.clone()))
    }

    async fn get(&self, id: Uuid) -> AppResult<Job> {
        self.lock()?
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::job_not_found(id))
    }

    async fn update_job(&self, id: Uuid, expected: JobStatus, patch: JobPatch) -> AppResult<Job> {
        let mut state = self.lock()?;
        let job = state.job_mut(id, expected)?;
        patch.apply(job, Timestamp::now());
        Ok(job.clone())
    }

    async fn dead_letter(
        &self,
        id: Uuid,
        patch: JobPatch,
        entry: DeadLetterEntry,
    ) -> AppResult<()> {
        let mut state = self.lock()?;
        let job = state.job_mut(id, JobStatus::Running)?;
        patch.apply(job, Timestamp::now());
        state.dead_letters.push(entry);
        Ok(())
    }

    async fn list_stale(&self, cutoff: Timestamp) -> AppResult<Vec<Job>> {
        let state = self.lock()?;
        let mut stale: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .filter(|job| job.started_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|job| job.started_at);
        Ok(stale)
    }

    async fn stats(&self) -> AppResult<JobStats> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.record(job.status, 1);
        }
        stats.unresolved_dead_letters = state
            .dead_letters
            .iter()
            .filter(|entry| !entry.is_resolved())
            .count() as i64;
        Ok(stats)
    }

    async fn list_dead_letters(
        &self,
        unresolved_only: bool,
        limit: i64,
    ) -> AppResult<Vec<DeadLetterEntry>> {
        let state = self.lock()?;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead_letters
            .iter()
            .filter(|entry| !unresolved_only || !entry.is_resolved())
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn resolve_dead_letter(&self, id: Uuid, notes: String) -> AppResult<DeadLetterEntry> {
        let mut state = self.lock()?;
        let entry = state
            .dead_letters
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| AppError::NotFound {
                entity: "DeadLetter".to_string(),
                field: "id".to_string(),
                value: id.to_string(),
            })?;

        if entry.is_resolved() {
            return Err(AppError::InvalidTransition {
                id: id.to_string(),
                expected: "unresolved".to_string(),
                actual: "resolved".to_string(),
            });
        }
        entry.resolved_at = Some(Timestamp::now());
        entry.resolution_notes = Some(notes);
        Ok(entry.clone())
    }

    async fn retry_job(
        &self,
        id: Uuid,
        expected: JobStatus,
        patch: JobPatch,
        notes: String,
    ) -> AppResult<(Job, usize)> {
        let mut state = self.lock()?;
        let now = Timestamp::now();
        let job = state.job_mut(id, expected)?;
        patch.apply(job, now);
        let job = job.clone();

        let mut resolved = 0;
        for entry in state
            .dead_letters
            .iter_mut()
            .filter(|entry| entry.job_id == id && !entry.is_resolved())
        {
            entry.resolved_at = Some(now);
            entry.resolution_notes = Some(notes.clone());
            resolved += 1;
        }
        Ok((job, resolved))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<String, BucketRecord>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn load(&self, name: &str) -> AppResult<Option<BucketRecord>> {
        Ok(self.buckets.lock().map_err(lock_error)?.get(name).cloned())
    }

    async fn save(&self, record: BucketRecord) -> AppResult<()> {
        self.buckets
            .lock()
            .map_err(lock_error)?
            .insert(record.name.clone(), record);
        Ok(())
    }

    async fn list(&self) -> AppResult<Vec<BucketRecord>> {
        let mut records: Vec<BucketRecord> = self
            .buckets
            .lock()
            .map_err(lock_error)?
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}
