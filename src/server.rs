//! Worker process lifecycle.
//!
//! Builds the application state, runs the dispatcher workers and the stale
//! job sweep, and shuts both down cleanly on Ctrl+C or SIGTERM.

use std::future::Future;

use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::{Settings, StoreBackend};
use crate::external::build_http_client;
use crate::jobs::{ReaperSchedule, webhook_registry};
use crate::state::{AppState, Stores};

/// Worker process manager
pub struct WorkerServer {
    settings: Settings,
}

impl WorkerServer {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run until a shutdown signal is received.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves.
    ///
    /// Workers stop claiming once it fires; jobs already executing finish
    /// before this returns.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let settings = &self.settings;

        tracing::info!(
            app_name = %settings.application.name,
            app_version = %settings.application.version,
            "Application starting"
        );
        tracing::info!(
            workers = settings.dispatcher.workers,
            poll_interval_ms = settings.dispatcher.poll_interval_ms,
            default_max_attempts = settings.dispatcher.default_max_attempts,
            "Dispatcher configuration loaded"
        );
        if settings.store.backend == StoreBackend::Postgres {
            tracing::info!(
                max_connections = settings.database.max_connections,
                min_connections = settings.database.min_connections,
                connection_timeout = settings.database.connection_timeout,
                "Database configuration loaded"
            );
        }

        let client = build_http_client(
            settings.handlers.request_timeout(),
            settings.handlers.connect_timeout(),
            &settings.handlers.user_agent,
        )?;
        let handlers = webhook_registry(&settings.handlers, client);

        let stores = Stores::connect(settings).await?;
        let state = AppState::new(settings, stores, handlers)?;
        tracing::info!("Application state created");

        let root = CancellationToken::new();
        let workers = state.dispatcher.spawn_workers(root.child_token());
        tracing::info!(workers = workers.len(), "Workers started");

        let schedule = if settings.reaper.enabled {
            let schedule =
                ReaperSchedule::start(state.reaper.clone(), &settings.reaper.cron).await?;
            tracing::info!(cron = %settings.reaper.cron, "Stale job sweep scheduled");
            Some(schedule)
        } else {
            None
        };

        shutdown.await;
        root.cancel();
        tracing::info!(in_flight = state.dispatcher.in_flight().len(), "Waiting for workers");

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
        if let Some(schedule) = schedule
            && let Err(e) = schedule.stop().await
        {
            tracing::warn!(error = %e, "Failed to stop stale job sweep");
        }

        state.guards.log_diagnostics();
        state.shutdown().await;
        tracing::info!("Worker shutdown complete");

        Ok(())
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_handlers_fail_startup() {
        let mut settings = Settings::default();
        settings.store.backend = StoreBackend::Memory;

        let result = WorkerServer::new(settings).run_until(async {}).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_runs_until_shutdown_with_memory_store() {
        let mut settings = Settings::default();
        settings.store.backend = StoreBackend::Memory;
        settings.reaper.enabled = false;
        settings.handlers.price_publish_url = Some("http://127.0.0.1:9/publish".to_string());
        settings.handlers.catalog_sync_url = Some("http://127.0.0.1:9/catalog".to_string());
        settings.handlers.market_data_sync_url = Some("http://127.0.0.1:9/market".to_string());
        settings.handlers.feature_compute_url = Some("http://127.0.0.1:9/features".to_string());

        let result = WorkerServer::new(settings)
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await;
        assert!(result.is_ok());
    }
}
