//! CLI argument parsing with clap
//!
//! This module defines the command-line interface structure using clap,
//! including all commands, arguments, and their documentation.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use uuid::Uuid;

use crate::jobs::{DEFAULT_PRIORITY, JobType};

// Include shadow-rs generated build information
use shadow_rs::shadow;
shadow!(build);

/// Durable job dispatcher with provider rate limiting and circuit breaking
#[derive(Parser, Debug)]
#[command(name = "jobguard")]
#[command(about = "Durable job dispatcher with provider rate limiting and circuit breaking")]
#[command(long_about = "
Jobguard runs background jobs against rate-limited providers. Jobs are
claimed from a durable queue, guarded by a token bucket and a circuit
breaker per provider, retried with exponential backoff and moved to a dead
letter queue once their attempts are exhausted.

EXAMPLES:
    # Start the workers with default configuration
    jobguard work

    # Start 8 workers with verbose logging
    jobguard --verbose work --workers 8

    # Check configuration without starting workers
    jobguard work --dry-run

    # Run database migrations
    jobguard migrate

    # Enqueue a job due in 30 seconds
    jobguard enqueue --job-type price_publish --input '{\"sku\":\"A-1\"}' --delay-secs 30

    # Inspect and resolve dead letters
    jobguard dead-letters
    jobguard resolve 6f1c0d2e-3b9a-4c1d-8e7f-0a1b2c3d4e5f --notes \"republished by hand\"

For more information about configuration options, see the documentation.
")]
#[command(version = build::CLAP_LONG_VERSION)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    ///
    /// Load this single TOML file instead of the layered files under the
    /// configuration directory. Environment variables still apply on top.
    ///
    /// Example: --config /etc/jobguard/production.toml
    #[arg(short, long, value_name = "FILE", value_parser = super::validation::validate_config_file_path)]
    pub config: Option<PathBuf>,

    /// Override environment detection
    ///
    /// Selects which config/{environment}.toml file is layered over the
    /// defaults. Available values: development (dev), production (prod),
    /// staging (stage), test
    #[arg(short, long, value_enum)]
    pub env: Option<Environment>,

    /// Enable verbose logging
    ///
    /// Increases log output to debug level. Cannot be used with --quiet.
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress non-error output
    ///
    /// Reduces log output to error level only. Cannot be used with --verbose.
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the dispatcher workers (default)
    ///
    /// Connects to the configured store, registers a webhook handler for every
    /// job type and runs the workers and the stale job sweep until Ctrl+C or
    /// SIGTERM. Every job type needs a handler URL.
    ///
    /// Examples:
    ///   jobguard work                  # Start with defaults
    ///   jobguard work --workers 8      # Override the worker count
    ///   jobguard work --dry-run        # Validate config without starting
    Work {
        /// Number of worker tasks
        #[arg(short, long, value_name = "N", value_parser = super::validation::validate_workers)]
        workers: Option<usize>,

        /// Log level override
        ///
        /// Overrides both configuration file settings and the global
        /// --verbose/--quiet flags.
        #[arg(long, value_enum)]
        log_level: Option<LogLevel>,

        /// Validate configuration and exit
        #[arg(long)]
        dry_run: bool,
    },
    /// Database migration operations
    ///
    /// Examples:
    ///   jobguard migrate                    # Apply all pending migrations
    ///   jobguard migrate --dry-run          # Show pending migrations without applying
    ///   jobguard migrate --rollback 3       # Rollback the last 3 migrations
    Migrate {
        /// Show pending migrations without applying
        #[arg(long, conflicts_with = "rollback")]
        dry_run: bool,

        /// Number of migrations to rollback (1 to 100)
        #[arg(long, value_name = "STEPS", conflicts_with = "dry_run", value_parser = super::validation::validate_rollback_steps)]
        rollback: Option<u32>,
    },
    /// Add a job to the queue
    Enqueue {
        /// price_publish, catalog_sync, market_data_sync or feature_compute
        #[arg(short = 't', long, value_name = "TYPE")]
        job_type: JobType,

        /// Job input as a JSON document
        #[arg(short, long, value_name = "JSON", default_value = "{}", value_parser = super::validation::validate_json_input)]
        input: serde_json::Value,

        /// Priority from 1 (lowest) to 10 (highest)
        #[arg(short, long, default_value_t = DEFAULT_PRIORITY, value_parser = super::validation::validate_priority)]
        priority: i16,

        /// Delay before the job becomes due
        #[arg(long, value_name = "SECONDS")]
        delay_secs: Option<u64>,

        /// Attempt budget, defaults to dispatcher.default_max_attempts
        #[arg(long, value_name = "N", value_parser = super::validation::validate_max_attempts)]
        max_attempts: Option<i32>,
    },
    /// Put a failed or cancelled job back in the queue with a fresh attempt budget
    Retry {
        /// Job id
        id: Uuid,
    },
    /// Cancel a pending or running job
    Cancel {
        /// Job id
        id: Uuid,
    },
    /// Show job counts per status
    Stats,
    /// List dead letters, newest first
    DeadLetters {
        /// Include resolved entries
        #[arg(long)]
        all: bool,

        /// Maximum number of entries
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(i64).range(1..=1000))]
        limit: i64,
    },
    /// Mark a dead letter as handled
    Resolve {
        /// Dead letter id
        id: Uuid,

        /// What was done about it
        #[arg(short, long)]
        notes: String,
    },
    /// Show persisted rate limit buckets
    Buckets,
}

/// Environment options
#[derive(ValueEnum, Clone, Debug)]
pub enum Environment {
    #[value(name = "development", alias = "dev")]
    Development,
    #[value(name = "production", alias = "prod")]
    Production,
    #[value(name = "test")]
    Test,
    #[value(name = "staging", alias = "stage")]
    Staging,
}

/// Log level options
#[derive(ValueEnum, Clone, Debug)]
pub enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn", alias = "warning")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl Cli {
    /// Checks argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if let Some(Commands::Migrate { dry_run, rollback }) = &self.command
            && *dry_run
            && rollback.is_some()
        {
            return Err("Cannot use --dry-run and --rollback together".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use --verbose and --quiet together".to_string());
        }

        Ok(())
    }

    /// Get detailed help for validation errors
    pub fn get_validation_help() -> &'static str {
        r#"
Common validation errors and solutions:

Configuration file validation:
  - File must exist and be readable
  - File must be in TOML format
  - Example: --config /path/to/config.toml

Job input validation:
  - Input must be valid JSON
  - Example: --input '{"sku":"A-1","price":9.99}'

Priority validation:
  - Priority must be between 1 and 10
  - Example: --priority 8

Migration rollback validation:
  - Steps must be between 1 and 100
  - Cannot be used with --dry-run
  - Example: --rollback 3

For more help, use: jobguard help <subcommand>
"#
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => "error".to_string(),
            LogLevel::Warn => "warn".to_string(),
            LogLevel::Info => "info".to_string(),
            LogLevel::Debug => "debug".to_string(),
            LogLevel::Trace => "trace".to_string(),
        }
    }
}

impl From<Environment> for crate::config::Environment {
    fn from(env: Environment) -> Self {
        match env {
            Environment::Development => crate::config::Environment::Development,
            Environment::Production => crate::config::Environment::Production,
            Environment::Test => crate::config::Environment::Test,
            Environment::Staging => crate::config::Environment::Staging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_help_flag() {
        let err = Cli::try_parse_from(["jobguard", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["jobguard", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_default_behavior() {
        let cli = Cli::try_parse_from(["jobguard"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
        assert!(!cli.quiet);
        assert!(cli.config.is_none());
        assert!(cli.env.is_none());
    }

    #[test]
    fn test_work_command() {
        let cli = Cli::try_parse_from(["jobguard", "work", "--workers", "8", "--dry-run"]).unwrap();
        match cli.command {
            Some(Commands::Work {
                workers, dry_run, ..
            }) => {
                assert_eq!(workers, Some(8));
                assert!(dry_run);
            }
            other => panic!("Expected Work command, got {:?}", other),
        }
    }

    #[test]
    fn test_work_rejects_zero_workers() {
        assert!(Cli::try_parse_from(["jobguard", "work", "--workers", "0"]).is_err());
    }

    #[test]
    fn test_migrate_command() {
        let cli = Cli::try_parse_from(["jobguard", "migrate", "--dry-run"]).unwrap();
        if let Some(Commands::Migrate { dry_run, rollback }) = cli.command {
            assert!(dry_run);
            assert!(rollback.is_none());
        } else {
            panic!("Expected Migrate command");
        }
    }

    #[test]
    fn test_migrate_dry_run_conflicts_with_rollback() {
        let err = Cli::try_parse_from(["jobguard", "migrate", "--dry-run", "--rollback", "2"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_enqueue_command() {
        let cli = Cli::try_parse_from([
            "jobguard",
            "enqueue",
            "--job-type",
            "market_data_sync",
            "--input",
            r#"{"symbols":["ACME"]}"#,
            "--priority",
            "9",
            "--delay-secs",
            "30",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Enqueue {
                job_type,
                input,
                priority,
                delay_secs,
                max_attempts,
            }) => {
                assert_eq!(job_type, JobType::MarketDataSync);
                assert_eq!(input, json!({"symbols": ["ACME"]}));
                assert_eq!(priority, 9);
                assert_eq!(delay_secs, Some(30));
                assert_eq!(max_attempts, None);
            }
            other => panic!("Expected Enqueue command, got {:?}", other),
        }
    }

    #[test]
    fn test_enqueue_defaults() {
        let cli = Cli::try_parse_from(["jobguard", "enqueue", "-t", "feature_compute"]).unwrap();
        match cli.command {
            Some(Commands::Enqueue {
                input, priority, ..
            }) => {
                assert_eq!(input, json!({}));
                assert_eq!(priority, DEFAULT_PRIORITY);
            }
            other => panic!("Expected Enqueue command, got {:?}", other),
        }
    }

    #[test]
    fn test_enqueue_rejects_bad_input() {
        assert!(Cli::try_parse_from(["jobguard", "enqueue", "-t", "nightly"]).is_err());
        assert!(
            Cli::try_parse_from(["jobguard", "enqueue", "-t", "catalog_sync", "-i", "{oops"])
                .is_err()
        );
        assert!(
            Cli::try_parse_from(["jobguard", "enqueue", "-t", "catalog_sync", "-p", "11"])
                .is_err()
        );
    }

    #[test]
    fn test_admin_commands_parse_ids() {
        let id = Uuid::new_v4();
        let id_str = id.to_string();

        let cli = Cli::try_parse_from(["jobguard", "retry", id_str.as_str()]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Retry { id: parsed }) if parsed == id));

        let cli =
            Cli::try_parse_from(["jobguard", "resolve", id_str.as_str(), "--notes", "done"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Resolve { id: parsed, ref notes }) if parsed == id && notes == "done"
        ));

        assert!(Cli::try_parse_from(["jobguard", "cancel", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_dead_letters_limit_range() {
        let cli = Cli::try_parse_from(["jobguard", "dead-letters", "--all"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::DeadLetters { all: true, limit: 20 })
        ));
        assert!(Cli::try_parse_from(["jobguard", "dead-letters", "--limit", "0"]).is_err());
    }

    #[test]
    fn test_verbose_flag() {
        let cli = Cli::try_parse_from(["jobguard", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_conflicting_verbose_quiet() {
        let err = Cli::try_parse_from(["jobguard", "--verbose", "--quiet"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}
