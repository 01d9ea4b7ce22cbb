use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use jiff::Timestamp;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::guards::GuardRegistry;
use crate::jobs::error::JobError;
use crate::jobs::models::{DeadLetterEntry, Job, JobPatch};
use crate::jobs::registry::HandlerRegistry;
use crate::jobs::retry::{Disposition, RetryPolicy, next_run};
use crate::jobs::timeout::{JobTimeouts, with_timeout};
use crate::jobs::types::{JobContext, JobStatus};
use crate::repositories::JobStore;

/// Cancellation tokens of the jobs currently executing in this process.
pub type InFlightJobs = Arc<DashMap<Uuid, CancellationToken>>;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    /// Longest a worker blocks waiting for a rate limit token.
    pub max_acquire_wait: Duration,
    /// How often a running job's row is re-read to notice a cancel issued
    /// by another process.
    pub status_check_interval: Duration,
    pub retry: RetryPolicy,
    pub timeouts: JobTimeouts,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            max_acquire_wait: Duration::from_secs(5),
            status_check_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            timeouts: JobTimeouts::default(),
        }
    }
}

/// Claims due jobs and runs them behind the provider guards.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    guards: Arc<GuardRegistry>,
    config: DispatcherConfig,
    in_flight: InFlightJobs,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        guards: Arc<GuardRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            guards,
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn in_flight(&self) -> InFlightJobs {
        Arc::clone(&self.in_flight)
    }

    pub fn guards(&self) -> &Arc<GuardRegistry> {
        &self.guards
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Starts the worker tasks.
    ///
    /// Workers stop claiming once `shutdown` is cancelled; a job already
    /// executing runs to completion first.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { dispatcher.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        debug!(worker, "Worker started");
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(worker, error = %e, "Dispatch cycle failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker, "Worker stopped");
    }

    /// Claims and runs at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> AppResult<bool> {
        let Some(job) = self.store.claim_next(Timestamp::now()).await? else {
            return Ok(false);
        };
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            priority = job.priority,
            "Claimed job"
        );

        let cancel = CancellationToken::new();
        self.in_flight.insert(job.id, cancel.clone());
        let execute = self.execute(&job, &cancel);
        tokio::pin!(execute);
        let outcome = tokio::select! {
            outcome = &mut execute => outcome,
            () = self.watch_status(job.id, &cancel) => execute.await,
        };
        self.in_flight.remove(&job.id);

        self.settle(&job, outcome).await?;
        Ok(true)
    }

    /// Resolves after cancelling `cancel` once the job's row is no longer
    /// RUNNING, e.g. when an admin cancelled it from another process.
    async fn watch_status(&self, id: Uuid, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return std::future::pending().await,
                _ = tokio::time::sleep(self.config.status_check_interval) => {}
            }

            match self.store.get(id).await {
                Ok(job) if job.status != JobStatus::Running => {
                    info!(job_id = %id, status = %job.status, "Job left running state, cancelling");
                    cancel.cancel();
                    return;
                }
                Ok(_) => {}
                Err(e) => debug!(job_id = %id, error = %e, "Status check failed"),
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Option<JsonValue>, JobError> {
        let handler = self
            .handlers
            .get(job.job_type)
            .ok_or(JobError::UnknownHandler(job.job_type))?;
        let limit = self.config.timeouts.for_job(job.job_type);

        let run = |token: CancellationToken| {
            let ctx = JobContext {
                job_id: job.id,
                job_type: job.job_type,
                attempt: job.attempts + 1,
                input: job.input.clone(),
                cancellation_token: token,
            };
            async move { handler.handle(ctx).await }
        };

        let Some(provider) = job.provider() else {
            return with_timeout(run, limit, cancel).await;
        };
        let guards = self.guards.for_provider(provider);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
            acquired = guards.limiter.acquire(1.0, self.config.max_acquire_wait) => acquired?,
        }

        let result = guards
            .breaker
            .execute(|| with_timeout(run, limit, cancel))
            .await;
        if result.is_ok() {
            guards.limiter.record_success();
        }
        result
    }

    /// Records the outcome of one attempt on a RUNNING job.
    ///
    /// If the job left RUNNING meanwhile (cancelled directly, or reaped)
    /// the outcome is discarded.
    pub async fn settle(
        &self,
        job: &Job,
        outcome: Result<Option<JsonValue>, JobError>,
    ) -> AppResult<()> {
        let now = Timestamp::now();
        let result = match outcome {
            Ok(value) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts + 1,
                    "Job succeeded"
                );
                self.store
                    .update_job(job.id, JobStatus::Running, JobPatch::succeeded(value, now))
                    .await
                    .map(|_| ())
            }
            Err(e) => self.settle_failure(job, e, now).await,
        };

        match result {
            Err(e) if e.is_invalid_transition() => {
                warn!(job_id = %job.id, error = %e, "Job changed state while running, outcome discarded");
                Ok(())
            }
            other => other,
        }
    }

    async fn settle_failure(&self, job: &Job, error: JobError, now: Timestamp) -> AppResult<()> {
        let (error, delay_hint) = self.apply_rejection(job, error);

        match self
            .config
            .retry
            .decide(job.attempts, job.max_attempts, &error, delay_hint)
        {
            Disposition::Cancel => {
                info!(job_id = %job.id, job_type = %job.job_type, "Job cancelled");
                self.store
                    .update_job(job.id, JobStatus::Running, JobPatch::cancelled(now))
                    .await
                    .map(|_| ())
            }
            Disposition::Retry { attempts, delay } => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, requeued"
                );
                let scheduled_for = next_run(job.scheduled_for, now, delay);
                self.store
                    .update_job(
                        job.id,
                        JobStatus::Running,
                        JobPatch::requeued(attempts, scheduled_for, error.to_string()),
                    )
                    .await
                    .map(|_| ())
            }
            Disposition::DeadLetter { attempts } => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts,
                    error = %error,
                    "Job moved to dead letter queue"
                );
                let message = error.to_string();
                let entry = DeadLetterEntry::for_job(job, attempts, message.clone(), now);
                self.store
                    .dead_letter(job.id, JobPatch::failed(attempts, message, now), entry)
                    .await
            }
        }
    }

    /// Feeds a provider rejection to its limiter, which picks the back-off
    /// or declares the rejection limit reached.
    fn apply_rejection(&self, job: &Job, error: JobError) -> (JobError, Option<Duration>) {
        let (JobError::ProviderRejected { retry_after, .. }, Some(provider)) =
            (&error, job.provider())
        else {
            return (error, None);
        };

        match self.guards.limiter(provider).record_rejection(*retry_after) {
            Ok(wait) => (error, Some(wait)),
            Err(limit_reached) => (limit_reached, None),
        }
    }
}
