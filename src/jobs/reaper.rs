use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, warn};

use crate::error::{AppError, AppResult};
use crate::jobs::dispatcher::Dispatcher;
use crate::jobs::error::JobError;
use crate::repositories::JobStore;

/// Requeues jobs stuck in RUNNING after their worker disappeared.
pub struct StaleJobReaper {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    stale_after: Duration,
}

impl StaleJobReaper {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Arc<Dispatcher>, stale_after: Duration) -> Self {
        Self {
            store,
            dispatcher,
            stale_after,
        }
    }

    /// Settles every stale RUNNING job as a transient failure.
    ///
    /// Jobs executing in this process are skipped. Returns how many jobs
    /// were settled.
    pub async fn reap(&self) -> AppResult<usize> {
        let cutoff = Timestamp::now()
            .checked_sub(self.stale_after)
            .map_err(|e| AppError::Internal {
                source: anyhow::Error::from(e),
            })?;
        let in_flight = self.dispatcher.in_flight();
        let mut reaped = 0;

        for job in self.store.list_stale(cutoff).await? {
            if in_flight.contains_key(&job.id) {
                continue;
            }
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                started_at = ?job.started_at,
                "Reaping stale running job"
            );
            self.dispatcher
                .settle(&job, Err(JobError::transient("worker lost")))
                .await?;
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn tick(&self) {
        match self.reap().await {
            Ok(0) => {}
            Ok(reaped) => debug!(reaped, "Stale job sweep finished"),
            Err(e) => error!(error = %e, "Stale job sweep failed"),
        }
        self.dispatcher.guards().log_diagnostics();
    }
}

/// Cron-driven wrapper around the reaper.
pub struct ReaperSchedule {
    scheduler: Mutex<JobScheduler>,
}

impl ReaperSchedule {
    pub async fn start(reaper: Arc<StaleJobReaper>, cron: &str) -> AppResult<Self> {
        let scheduler = JobScheduler::new().await.map_err(|e| AppError::Internal {
            source: anyhow::Error::from(e),
        })?;

        let job = CronJob::new_async(cron, move |_uuid, _lock| {
            let reaper = Arc::clone(&reaper);
            Box::pin(async move { reaper.tick().await })
        })
        .map_err(|e| AppError::validation("reaper.cron", format!("Invalid cron expression: {}", e)))?;

        scheduler.add(job).await.map_err(|e| AppError::Internal {
            source: anyhow::Error::from(e),
        })?;
        scheduler.start().await.map_err(|e| AppError::Internal {
            source: anyhow::Error::from(e),
        })?;

        Ok(Self {
            scheduler: Mutex::new(scheduler),
        })
    }

    pub async fn stop(&self) -> AppResult<()> {
        self.scheduler
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| AppError::Internal {
                source: anyhow::Error::from(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};

    use crate::circuit::CircuitBreakerConfig;
    use crate::guards::GuardRegistry;
    use crate::jobs::dispatcher::DispatcherConfig;
    use crate::jobs::models::NewJob;
    use crate::jobs::registry::HandlerRegistry;
    use crate::jobs::types::{JobContext, JobHandler, JobStatus, JobType};
    use crate::ratelimit::RateLimitPolicy;
    use crate::repositories::MemoryJobStore;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _ctx: JobContext) -> Result<Option<JsonValue>, JobError> {
            Ok(None)
        }
    }

    fn reaper(store: Arc<MemoryJobStore>, stale_after: Duration) -> StaleJobReaper {
        let mut handlers = HandlerRegistry::new();
        for job_type in JobType::ALL {
            handlers.register(job_type, Noop);
        }
        let guards = GuardRegistry::new(
            |_| RateLimitPolicy::default(),
            |_| CircuitBreakerConfig::default(),
            None,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(handlers),
            Arc::new(guards),
            DispatcherConfig::default(),
        ));
        StaleJobReaper::new(store, dispatcher, stale_after)
    }

    #[tokio::test]
    async fn test_reaps_stale_job_as_transient_failure() {
        let store = Arc::new(MemoryJobStore::new());
        let long_ago = Timestamp::now().checked_sub(Duration::from_secs(3600)).unwrap();
        let job = store
            .enqueue(NewJob::new(JobType::FeatureCompute, json!({})).scheduled_for(long_ago))
            .await
            .unwrap();
        let claimed = store.claim_next(long_ago).await.unwrap().unwrap();
        assert_eq!(claimed.started_at, Some(long_ago));

        let reaper = reaper(store.clone(), Duration::from_secs(600));
        assert_eq!(reaper.reap().await.unwrap(), 1);

        let job = store.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some("Transient failure: worker lost"));
    }

    #[tokio::test]
    async fn test_leaves_recent_jobs_alone() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .enqueue(NewJob::new(JobType::FeatureCompute, json!({})))
            .await
            .unwrap();
        store.claim_next(Timestamp::now()).await.unwrap().unwrap();

        let reaper = reaper(store.clone(), Duration::from_secs(600));
        assert_eq!(reaper.reap().await.unwrap(), 0);
        assert_eq!(store.stats().await.unwrap().running, 1);
    }

    #[tokio::test]
    async fn test_schedule_starts_and_stops() {
        let reaper = Arc::new(reaper(Arc::new(MemoryJobStore::new()), Duration::from_secs(600)));

        let schedule = ReaperSchedule::start(Arc::clone(&reaper), "0 * * * * *")
            .await
            .unwrap();
        schedule.stop().await.unwrap();

        let err = ReaperSchedule::start(reaper, "every minute").await.err().unwrap();
        assert!(matches!(err, AppError::Validation { ref field, .. } if field == "reaper.cron"));
    }
}
