//! Command executor for dispatching CLI commands
//!
//! This module provides the main entry point for executing CLI commands
//! after parsing and configuration loading.

use super::handlers::{AdminCommandHandler, MigrateCommandHandler, WorkCommandHandler};
use super::parser::{Cli, Commands};
use crate::config::settings::Settings;
use crate::error::{AppError, AppResult};

/// Execute a CLI command with the given settings
///
/// No subcommand means `work`.
pub async fn execute_command(cli: &Cli, settings: Settings) -> AppResult<()> {
    validate_command_args(cli)?;

    let Some(command) = &cli.command else {
        return WorkCommandHandler::new(settings).execute(false).await;
    };

    match command {
        Commands::Work { dry_run, .. } => WorkCommandHandler::new(settings).execute(*dry_run).await,
        Commands::Migrate { dry_run, rollback } => {
            MigrateCommandHandler::new(settings)
                .execute(*dry_run, *rollback)
                .await
        }
        Commands::Enqueue {
            job_type,
            input,
            priority,
            delay_secs,
            max_attempts,
        } => {
            AdminCommandHandler::connect(&settings)
                .await?
                .enqueue(*job_type, input.clone(), *priority, *delay_secs, *max_attempts)
                .await
                .map(|_| ())
        }
        Commands::Retry { id } => AdminCommandHandler::connect(&settings).await?.retry(*id).await,
        Commands::Cancel { id } => AdminCommandHandler::connect(&settings)
            .await?
            .cancel(*id)
            .await
            .map(|_| ()),
        Commands::Stats => AdminCommandHandler::connect(&settings)
            .await?
            .stats()
            .await
            .map(|_| ()),
        Commands::DeadLetters { all, limit } => AdminCommandHandler::connect(&settings)
            .await?
            .dead_letters(*all, *limit)
            .await
            .map(|_| ()),
        Commands::Resolve { id, notes } => {
            AdminCommandHandler::connect(&settings)
                .await?
                .resolve(*id, notes.clone())
                .await
        }
        Commands::Buckets => AdminCommandHandler::connect(&settings)
            .await?
            .buckets()
            .await
            .map(|_| ()),
    }
}

/// Validate command arguments before execution
fn validate_command_args(cli: &Cli) -> AppResult<()> {
    cli.validate()
        .map_err(|msg| AppError::validation("cli_arguments", msg))?;

    if let Some(Commands::Migrate {
        rollback: Some(steps),
        ..
    }) = &cli.command
        && *steps > 50
    {
        eprintln!(
            "Warning: Rolling back {} migrations is a large operation. Consider using smaller steps.",
            steps
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::parser::Cli;
    use crate::config::StoreBackend;
    use clap::Parser;

    fn create_valid_config() -> Settings {
        let mut config = Settings::default();
        config.database.url = "postgres://localhost/jobguard_test".to_string();
        config.handlers.price_publish_url = Some("http://localhost:9000/publish".to_string());
        config.handlers.catalog_sync_url = Some("http://localhost:9000/catalog".to_string());
        config.handlers.market_data_sync_url = Some("http://localhost:9000/market".to_string());
        config.handlers.feature_compute_url = Some("http://localhost:9000/features".to_string());
        config
    }

    #[tokio::test]
    async fn test_execute_work_dry_run() {
        let cli = Cli::try_parse_from(["jobguard", "work", "--dry-run"]).unwrap();
        assert!(execute_command(&cli, create_valid_config()).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_stats_on_memory_store() {
        let cli = Cli::try_parse_from(["jobguard", "stats"]).unwrap();
        let mut config = create_valid_config();
        config.store.backend = StoreBackend::Memory;
        assert!(execute_command(&cli, config).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_retry_unknown_job() {
        let id = uuid::Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from(["jobguard", "retry", id.as_str()]).unwrap();
        let mut config = create_valid_config();
        config.store.backend = StoreBackend::Memory;

        let err = execute_command(&cli, config).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[test]
    fn test_validate_conflicting_args() {
        let cli = Cli {
            command: Some(Commands::Migrate {
                dry_run: true,
                rollback: Some(5),
            }),
            config: None,
            env: None,
            verbose: false,
            quiet: false,
        };

        let result = validate_command_args(&cli);
        assert!(matches!(result, Err(AppError::Validation { .. })));
    }
}
