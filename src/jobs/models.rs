use diesel::prelude::*;
use jiff::Timestamp;
use jiff_diesel::ToDiesel;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;
use validator::Validate;

use crate::jobs::types::{JobStatus, JobType, Provider};
use crate::schema::{dead_letters, jobs};

pub const MIN_PRIORITY: i16 = 1;
pub const MAX_PRIORITY: i16 = 10;
pub const DEFAULT_PRIORITY: i16 = 5;

// ============================================================================
// Job
// ============================================================================

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i16,
    pub attempts: i32,
    pub max_attempts: i32,
    pub input: JsonValue,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub scheduled_for: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    pub fn provider(&self) -> Option<Provider> {
        self.job_type.provider()
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct NewJob {
    pub job_type: JobType,
    pub input: JsonValue,
    #[validate(range(min = 1, max = 10, message = "Priority must be between 1 and 10"))]
    pub priority: i16,
    #[validate(range(min = 1, message = "Max attempts must be at least 1"))]
    pub max_attempts: i32,
    pub scheduled_for: Option<Timestamp>,
}

impl NewJob {
    pub fn new(job_type: JobType, input: JsonValue) -> Self {
        Self {
            job_type,
            input,
            priority: DEFAULT_PRIORITY,
            max_attempts: 5,
            scheduled_for: None,
        }
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_for(mut self, at: Timestamp) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Build the PENDING job this request describes.
    pub fn into_job(self, now: Timestamp) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type: self.job_type,
            status: JobStatus::Pending,
            priority: self.priority,
            attempts: 0,
            max_attempts: self.max_attempts,
            input: self.input,
            result: None,
            error_message: None,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to a job by the dispatcher or the admin API.
///
/// Nested options distinguish "leave unchanged" (`None`) from "clear"
/// (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<i32>,
    pub scheduled_for: Option<Timestamp>,
    pub started_at: Option<Option<Timestamp>>,
    pub finished_at: Option<Option<Timestamp>>,
    pub result: Option<Option<JsonValue>>,
    pub error_message: Option<Option<String>>,
}

impl JobPatch {
    pub fn running(now: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Running),
            started_at: Some(Some(now)),
            finished_at: Some(None),
            ..Default::default()
        }
    }

    pub fn succeeded(result: Option<JsonValue>, now: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Succeeded),
            finished_at: Some(Some(now)),
            result: Some(result),
            error_message: Some(None),
            ..Default::default()
        }
    }

    pub fn requeued(attempts: i32, scheduled_for: Timestamp, error: String) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            attempts: Some(attempts),
            scheduled_for: Some(scheduled_for),
            error_message: Some(Some(error)),
            ..Default::default()
        }
    }

    pub fn failed(attempts: i32, error: String, now: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            attempts: Some(attempts),
            finished_at: Some(Some(now)),
            error_message: Some(Some(error)),
            ..Default::default()
        }
    }

    pub fn cancelled(now: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            finished_at: Some(Some(now)),
            error_message: Some(Some("cancelled".to_string())),
            ..Default::default()
        }
    }

    /// Manual retry: back to PENDING with a fresh attempt budget.
    pub fn reset_for_retry(scheduled_for: Timestamp) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            attempts: Some(0),
            scheduled_for: Some(scheduled_for),
            started_at: Some(None),
            finished_at: Some(None),
            result: Some(None),
            error_message: Some(None),
        }
    }

    pub fn apply(&self, job: &mut Job, now: Timestamp) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(scheduled_for) = self.scheduled_for {
            job.scheduled_for = scheduled_for;
        }
        if let Some(started_at) = self.started_at {
            job.started_at = started_at;
        }
        if let Some(finished_at) = self.finished_at {
            job.finished_at = finished_at;
        }
        if let Some(result) = &self.result {
            job.result = result.clone();
        }
        if let Some(error_message) = &self.error_message {
            job.error_message = error_message.clone();
        }
        job.updated_at = now;
    }
}

// ============================================================================
// Dead letters
// ============================================================================

/// Terminal record of a job whose retry budget is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_type: JobType,
    pub payload: JsonValue,
    pub attempts: i32,
    pub last_error: String,
    pub failed_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
    pub resolution_notes: Option<String>,
}

impl DeadLetterEntry {
    pub fn for_job(job: &Job, attempts: i32, last_error: String, failed_at: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_type: job.job_type,
            payload: job.input.clone(),
            attempts,
            last_error,
            failed_at,
            resolved_at: None,
            resolution_notes: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub unresolved_dead_letters: i64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.running + self.succeeded + self.failed + self.cancelled
    }
}

// ============================================================================
// Diesel records
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i16,
    pub attempts: i32,
    pub max_attempts: i32,
    pub input: JsonValue,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub scheduled_for: jiff_diesel::Timestamp,
    pub started_at: Option<jiff_diesel::Timestamp>,
    pub finished_at: Option<jiff_diesel::Timestamp>,
    pub created_at: jiff_diesel::Timestamp,
    pub updated_at: jiff_diesel::Timestamp,
}

impl From<JobRecord> for Job {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id,
            job_type: record.job_type,
            status: record.status,
            priority: record.priority,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            input: record.input,
            result: record.result,
            error_message: record.error_message,
            scheduled_for: record.scheduled_for.to_jiff(),
            started_at: record.started_at.map(|ts| ts.to_jiff()),
            finished_at: record.finished_at.map(|ts| ts.to_jiff()),
            created_at: record.created_at.to_jiff(),
            updated_at: record.updated_at.to_jiff(),
        }
    }
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            input: job.input.clone(),
            result: job.result.clone(),
            error_message: job.error_message.clone(),
            scheduled_for: job.scheduled_for.to_diesel(),
            started_at: job.started_at.map(|ts| ts.to_diesel()),
            finished_at: job.finished_at.map(|ts| ts.to_diesel()),
            created_at: job.created_at.to_diesel(),
            updated_at: job.updated_at.to_diesel(),
        }
    }
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = jobs)]
pub struct JobChangeset {
    pub status: Option<JobStatus>,
    pub attempts: Option<i32>,
    pub scheduled_for: Option<jiff_diesel::Timestamp>,
    pub started_at: Option<Option<jiff_diesel::Timestamp>>,
    pub finished_at: Option<Option<jiff_diesel::Timestamp>>,
    pub result: Option<Option<JsonValue>>,
    pub error_message: Option<Option<String>>,
    pub updated_at: jiff_diesel::Timestamp,
}

impl JobChangeset {
    pub fn from_patch(patch: &JobPatch, now: Timestamp) -> Self {
        Self {
            status: patch.status,
            attempts: patch.attempts,
            scheduled_for: patch.scheduled_for.map(|ts| ts.to_diesel()),
            started_at: patch.started_at.map(|ts| ts.map(|ts| ts.to_diesel())),
            finished_at: patch.finished_at.map(|ts| ts.map(|ts| ts.to_diesel())),
            result: patch.result.clone(),
            error_message: patch.error_message.clone(),
            updated_at: now.to_diesel(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = dead_letters)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_type: JobType,
    pub payload: JsonValue,
    pub attempts: i32,
    pub last_error: String,
    pub failed_at: jiff_diesel::Timestamp,
    pub resolved_at: Option<jiff_diesel::Timestamp>,
    pub resolution_notes: Option<String>,
}

impl From<DeadLetterRecord> for DeadLetterEntry {
    fn from(record: DeadLetterRecord) -> Self {
        Self {
            id: record.id,
            job_id: record.job_id,
            job_type: record.job_type,
            payload: record.payload,
            attempts: record.attempts,
            last_error: record.last_error,
            failed_at: record.failed_at.to_jiff(),
            resolved_at: record.resolved_at.map(|ts| ts.to_jiff()),
            resolution_notes: record.resolution_notes,
        }
    }
}

impl From<&DeadLetterEntry> for DeadLetterRecord {
    fn from(entry: &DeadLetterEntry) -> Self {
        Self {
            id: entry.id,
            job_id: entry.job_id,
            job_type: entry.job_type,
            payload: entry.payload.clone(),
            attempts: entry.attempts,
            last_error: entry.last_error.clone(),
            failed_at: entry.failed_at.to_diesel(),
            resolved_at: entry.resolved_at.map(|ts| ts.to_diesel()),
            resolution_notes: entry.resolution_notes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_defaults() {
        let now = Timestamp::now();
        let job = NewJob::new(JobType::CatalogSync, json!({"sku": "A-1"})).into_job(now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.scheduled_for, now);
        assert_eq!(job.provider(), Some(Provider::Catalog));
    }

    #[test]
    fn test_new_job_priority_bounds() {
        let base = NewJob::new(JobType::FeatureCompute, json!({}));
        assert!(base.clone().with_priority(1).validate().is_ok());
        assert!(base.clone().with_priority(10).validate().is_ok());
        assert!(base.clone().with_priority(0).validate().is_err());
        assert!(base.clone().with_priority(11).validate().is_err());
        assert!(base.with_max_attempts(0).validate().is_err());
    }

    #[test]
    fn test_patch_apply_clears_and_sets() {
        let now = Timestamp::now();
        let mut job = NewJob::new(JobType::PricePublish, json!({})).into_job(now);
        JobPatch::running(now).apply(&mut job, now);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.started_at, Some(now));

        JobPatch::failed(3, "boom".to_string(), now).apply(&mut job, now);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        JobPatch::reset_for_retry(now).apply(&mut job, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.error_message, None);
        assert_eq!(job.finished_at, None);
    }

    #[test]
    fn test_is_due() {
        let now = Timestamp::now();
        let later = crate::jobs::types::add_duration(now, std::time::Duration::from_secs(60));
        let job = NewJob::new(JobType::FeatureCompute, json!({}))
            .scheduled_for(later)
            .into_job(now);
        assert!(!job.is_due(now));
        assert!(job.is_due(later));
    }

    #[test]
    fn test_stats_record() {
        let mut stats = JobStats::default();
        stats.record(JobStatus::Pending, 2);
        stats.record(JobStatus::Failed, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);
    }
}
