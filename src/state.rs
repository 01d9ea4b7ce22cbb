//! Application state for the worker process and admin commands.
//!
//! Wires the stores, guards, dispatcher, queue and reaper together. This is
//! the only place where those components are constructed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Settings, StoreBackend};
use crate::db::establish_async_connection_pool;
use crate::error::AppResult;
use crate::guards::GuardRegistry;
use crate::jobs::{Dispatcher, HandlerRegistry, JobQueue, StaleJobReaper};
use crate::ratelimit::BucketPersister;
use crate::repositories::{
    BucketRepository, BucketStore, JobRepository, JobStore, MemoryBucketStore, MemoryJobStore,
};

/// Upper bound on waiting for queued bucket snapshots at shutdown.
const PERSIST_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Job and bucket storage for the configured backend.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub buckets: Arc<dyn BucketStore>,
}

impl Stores {
    /// Opens the backend selected by `store.backend`.
    pub async fn connect(settings: &Settings) -> AppResult<Self> {
        match settings.store.backend {
            StoreBackend::Postgres => {
                let pool = establish_async_connection_pool(&settings.database).await?;
                info!("Database connection pool initialized");
                Ok(Self {
                    jobs: Arc::new(JobRepository::new(pool.clone())),
                    buckets: Arc::new(BucketRepository::new(pool)),
                })
            }
            StoreBackend::Memory => {
                warn!("Using in-memory stores; jobs and bucket state are lost on exit");
                Ok(Self::memory())
            }
        }
    }

    pub fn memory() -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            buckets: Arc::new(MemoryBucketStore::new()),
        }
    }

    /// Queue facade for one-shot admin commands, with no local in-flight jobs.
    pub fn admin_queue(&self, settings: &Settings) -> JobQueue {
        JobQueue::new(
            Arc::clone(&self.jobs),
            Arc::new(DashMap::new()),
            settings.dispatcher.default_max_attempts,
        )
    }
}

/// Everything a worker process runs.
///
/// Must be built inside a tokio runtime since it spawns the bucket writer.
pub struct AppState {
    pub stores: Stores,
    pub guards: Arc<GuardRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: JobQueue,
    pub reaper: Arc<StaleJobReaper>,
    persist_writer: JoinHandle<()>,
}

impl AppState {
    /// Builds the state, failing if any job type lacks a handler.
    pub fn new(settings: &Settings, stores: Stores, handlers: HandlerRegistry) -> AppResult<Self> {
        handlers.validate()?;

        let (persister, persist_writer) =
            BucketPersister::spawn(Arc::clone(&stores.buckets), settings.persistence.policy());
        let guards = Arc::new(GuardRegistry::from_settings(settings, Some(persister)));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&stores.jobs),
            Arc::new(handlers),
            Arc::clone(&guards),
            settings.dispatcher.dispatcher_config(&settings.timeouts),
        ));
        let queue = JobQueue::new(
            Arc::clone(&stores.jobs),
            dispatcher.in_flight(),
            settings.dispatcher.default_max_attempts,
        );
        let stale_after = settings
            .reaper
            .stale_after(&settings.timeouts, dispatcher.config().max_acquire_wait);
        let reaper = Arc::new(StaleJobReaper::new(
            Arc::clone(&stores.jobs),
            Arc::clone(&dispatcher),
            stale_after,
        ));

        Ok(Self {
            stores,
            guards,
            dispatcher,
            queue,
            reaper,
            persist_writer,
        })
    }

    /// Drops every guard handle and waits for pending bucket writes.
    ///
    /// The writer only exits once all persister clones are gone, so any
    /// clone still held elsewhere makes this return after the flush timeout.
    pub async fn shutdown(self) {
        let Self {
            stores,
            guards,
            dispatcher,
            queue,
            reaper,
            persist_writer,
        } = self;

        let stats = guards.diagnostics().persistence;
        drop((stores, guards, dispatcher, queue, reaper));

        match tokio::time::timeout(PERSIST_FLUSH_TIMEOUT, persist_writer).await {
            Ok(Ok(())) => info!(stats = ?stats, "Bucket snapshots flushed"),
            Ok(Err(e)) => warn!(error = %e, "Bucket writer task failed"),
            Err(_) => warn!("Timed out flushing bucket snapshots"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};

    use crate::error::AppError;
    use crate::jobs::{JobContext, JobError, JobHandler, JobType};

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, ctx: JobContext) -> Result<Option<JsonValue>, JobError> {
            Ok(Some(ctx.input))
        }
    }

    fn all_handlers() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for job_type in JobType::ALL {
            registry.register(job_type, Echo);
        }
        registry
    }

    #[tokio::test]
    async fn test_missing_handler_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::PricePublish, Echo);

        let result = AppState::new(&Settings::default(), Stores::memory(), registry);
        assert!(matches!(result, Err(AppError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_queue_and_dispatcher_share_store() {
        let state = AppState::new(&Settings::default(), Stores::memory(), all_handlers()).unwrap();

        let id = state
            .queue
            .enqueue(JobType::CatalogSync, json!({"sku": "A-1"}), 5, None, None)
            .await
            .unwrap();
        assert!(state.dispatcher.run_once().await.unwrap());

        let job = state.queue.get(id).await.unwrap();
        assert_eq!(job.result, Some(json!({"sku": "A-1"})));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_queue_uses_default_max_attempts() {
        let mut settings = Settings::default();
        settings.dispatcher.default_max_attempts = 7;
        let stores = Stores::memory();

        let id = stores
            .admin_queue(&settings)
            .enqueue(JobType::FeatureCompute, json!({}), 5, None, None)
            .await
            .unwrap();
        assert_eq!(stores.jobs.get(id).await.unwrap().max_attempts, 7);
    }
}
