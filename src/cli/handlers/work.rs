//! Work command handler
//!
//! Validates the configuration and runs the worker process.

use crate::config::settings::Settings;
use crate::config::StoreBackend;
use crate::error::{AppError, AppResult};
use crate::jobs::JobType;
use crate::server::WorkerServer;

use super::MigrateCommandHandler;

/// Handler for the work command
pub struct WorkCommandHandler {
    config: Settings,
}

impl WorkCommandHandler {
    pub fn new(config: Settings) -> Self {
        Self { config }
    }

    /// Run the workers, or with `dry_run` only report what would run
    pub async fn execute(&self, dry_run: bool) -> AppResult<()> {
        self.config.validate()?;
        self.check_handlers()?;

        if dry_run {
            self.print_summary();
            return Ok(());
        }

        if self.config.store.backend == StoreBackend::Postgres && self.config.database.auto_migrate {
            MigrateCommandHandler::new(self.config.clone())
                .execute(false, None)
                .await?;
        }

        WorkerServer::new(self.config.clone())
            .run()
            .await
            .map_err(AppError::from)
    }

    /// Every job type needs an endpoint before any worker starts
    fn check_handlers(&self) -> AppResult<()> {
        let missing: Vec<&str> = JobType::ALL
            .iter()
            .filter(|t| self.config.handlers.webhook_for(**t).is_none())
            .map(JobType::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::validation(
                "handlers",
                format!("No webhook URL configured for: {}", missing.join(", ")),
            ))
        }
    }

    fn print_summary(&self) {
        let config = &self.config;

        println!("✓ Configuration is valid");
        println!(
            "✓ Store backend: {}",
            match config.store.backend {
                StoreBackend::Postgres => "postgres",
                StoreBackend::Memory => "memory",
            }
        );
        println!("✓ Workers: {}", config.dispatcher.workers);
        for job_type in JobType::ALL {
            println!(
                "✓ {} -> {} (timeout {}s)",
                job_type,
                config.handlers.webhook_for(job_type).unwrap_or("-"),
                config.timeouts.for_job(job_type).as_secs()
            );
        }
        for provider in crate::jobs::Provider::ALL {
            let limits = config.rate_limits.for_provider(provider);
            let breaker = config.circuit_breakers.for_provider(provider);
            println!(
                "✓ {}: {} tokens, {}/min, breaker opens after {} failures",
                provider, limits.capacity, limits.refill_per_minute, breaker.failure_threshold
            );
        }
        if config.reaper.enabled {
            println!("✓ Stale job sweep: {}", config.reaper.cron);
        }

        println!("Dry run completed successfully - configuration is ready for deployment");
    }

    pub fn config(&self) -> &Settings {
        &self.config
    }
}
