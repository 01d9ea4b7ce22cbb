//! Configuration validation logic
//!
//! This module provides validation methods for all configuration structures
//! to ensure configuration values are within acceptable ranges and formats.

use crate::config::error::ConfigError;
use crate::config::settings::{
    CircuitBreakerSettings, DatabaseConfig, DispatcherSettings, FileSettings, HandlersConfig,
    LoggerSettings, PersistenceSettings, RateLimitSettings, ReaperSettings, Settings, StoreBackend,
};
use crate::jobs::timeout::JobTimeouts;
use crate::jobs::types::{JobType, Provider};

/// Valid log levels
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid log formats
const VALID_LOG_FORMATS: &[&str] = &["full", "compact", "json"];

impl DatabaseConfig {
    /// Validate database configuration
    ///
    /// # Validation Rules
    /// - URL must not be empty and must use a Postgres scheme
    /// - Max and min connections must be greater than 0
    /// - Min connections must not exceed max connections
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::validation(
                "database.url",
                "Database URL is required. Please specify a valid database connection string.",
            ));
        }

        if !self.is_valid_database_url() {
            return Err(ConfigError::validation(
                "database.url",
                "Invalid database URL format. Expected format: postgres://[user:password@]host[:port]/database",
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::validation(
                "database.max_connections",
                "Max connections must be greater than 0.",
            ));
        }

        if self.min_connections == 0 {
            return Err(ConfigError::validation(
                "database.min_connections",
                "Min connections must be greater than 0.",
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::ValidationError {
                field: "database.min_connections".to_string(),
                message: format!(
                    "Min connections ({}) cannot exceed max connections ({}).",
                    self.min_connections, self.max_connections
                ),
            });
        }

        Ok(())
    }

    fn is_valid_database_url(&self) -> bool {
        ["postgres://", "postgresql://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
    }
}

impl FileSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.path.trim().is_empty() {
            return Err(ConfigError::validation(
                "logger.file.path",
                "File path is required when file logging is enabled.",
            ));
        }

        if !VALID_LOG_FORMATS.contains(&self.format.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError {
                field: "logger.file.format".to_string(),
                message: format!(
                    "Invalid log format '{}'. Valid formats are: {}",
                    self.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        Ok(())
    }
}

impl LoggerSettings {
    /// Validate logger settings
    ///
    /// The level may carry per-target directives (`info,jobguard::jobs=debug`);
    /// only the bare default level is checked against the known levels.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let default_level = self
            .level
            .split(',')
            .find(|directive| !directive.contains('='))
            .unwrap_or("info")
            .trim()
            .to_lowercase();

        if !VALID_LOG_LEVELS.contains(&default_level.as_str()) {
            return Err(ConfigError::ValidationError {
                field: "logger.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Valid levels are: {}",
                    self.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        if !self.console.enabled && !self.file.enabled {
            return Err(ConfigError::validation(
                "logger",
                "At least one output (console or file) must be enabled.",
            ));
        }

        self.file.validate()
    }
}

impl DispatcherSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::validation(
                "dispatcher.workers",
                "At least one worker is required.",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::validation(
                "dispatcher.poll_interval_ms",
                "Poll interval must be greater than 0 milliseconds.",
            ));
        }

        if self.status_check_interval_ms == 0 {
            return Err(ConfigError::validation(
                "dispatcher.status_check_interval_ms",
                "Status check interval must be greater than 0 milliseconds.",
            ));
        }

        if self.default_max_attempts < 1 {
            return Err(ConfigError::validation(
                "dispatcher.default_max_attempts",
                "Jobs need at least one attempt.",
            ));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError {
                field: "dispatcher.backoff_multiplier".to_string(),
                message: format!(
                    "Backoff multiplier must be a finite number >= 1.0, got {}.",
                    self.backoff_multiplier
                ),
            });
        }

        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(ConfigError::ValidationError {
                field: "dispatcher.backoff_base_secs".to_string(),
                message: format!(
                    "Backoff base ({}s) cannot exceed backoff max ({}s).",
                    self.backoff_base_secs, self.backoff_max_secs
                ),
            });
        }

        Ok(())
    }
}

impl JobTimeouts {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_secs == 0 {
            return Err(ConfigError::validation(
                "timeouts.default_secs",
                "Default timeout must be greater than 0 seconds.",
            ));
        }

        for job_type in JobType::ALL {
            if self.for_job(job_type).is_zero() {
                return Err(ConfigError::ValidationError {
                    field: format!("timeouts.{}_secs", job_type),
                    message: "Timeout must be greater than 0 seconds.".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl RateLimitSettings {
    fn validate(&self, provider: Provider) -> Result<(), ConfigError> {
        let field = |name: &str| format!("rate_limits.{}.{}", provider, name);

        // Each job acquires one token
        if !self.capacity.is_finite() || self.capacity < 1.0 {
            return Err(ConfigError::validation(
                field("capacity"),
                format!("Capacity must be at least 1 token, got {}.", self.capacity),
            ));
        }

        if !self.refill_per_minute.is_finite() || self.refill_per_minute <= 0.0 {
            return Err(ConfigError::validation(
                field("refill_per_minute"),
                "Refill rate must be a positive number.".to_string(),
            ));
        }

        if self.max_consecutive_rejections == 0 {
            return Err(ConfigError::validation(
                field("max_consecutive_rejections"),
                "Must allow at least one rejection.".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::validation(
                field("jitter_ratio"),
                format!("Jitter ratio must be within 0.0..=1.0, got {}.", self.jitter_ratio),
            ));
        }

        if self.max_batch_size == Some(0) {
            return Err(ConfigError::validation(
                field("max_batch_size"),
                "Max batch size must be greater than 0.".to_string(),
            ));
        }

        Ok(())
    }
}

impl CircuitBreakerSettings {
    fn validate(&self, provider: Provider) -> Result<(), ConfigError> {
        let field = |name: &str| format!("circuit_breakers.{}.{}", provider, name);

        if self.failure_threshold == 0 {
            return Err(ConfigError::validation(
                field("failure_threshold"),
                "Failure threshold must be greater than 0.".to_string(),
            ));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::validation(
                field("success_threshold"),
                "Success threshold must be greater than 0.".to_string(),
            ));
        }

        if self.half_open_max_calls == 0 {
            return Err(ConfigError::validation(
                field("half_open_max_calls"),
                "At least one half-open probe must be allowed.".to_string(),
            ));
        }

        Ok(())
    }
}

impl PersistenceSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::validation(
                "persistence.queue_capacity",
                "Queue capacity must be greater than 0.",
            ));
        }
        Ok(())
    }
}

impl ReaperSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.cron.split_whitespace().count() != 6 {
            return Err(ConfigError::ValidationError {
                field: "reaper.cron".to_string(),
                message: format!(
                    "Expected a six-field cron expression (sec min hour day month weekday), got '{}'.",
                    self.cron
                ),
            });
        }

        if self.stale_after_secs == Some(0) {
            return Err(ConfigError::validation(
                "reaper.stale_after_secs",
                "Stale threshold must be greater than 0 seconds.",
            ));
        }

        Ok(())
    }
}

impl HandlersConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for job_type in JobType::ALL {
            if let Some(url) = self.webhook_for(job_type)
                && !(url.starts_with("http://") || url.starts_with("https://"))
            {
                return Err(ConfigError::ValidationError {
                    field: format!("handlers.{}_url", job_type),
                    message: format!("Webhook URL must start with http:// or https://, got '{}'.", url),
                });
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::validation(
                "handlers.request_timeout_secs",
                "Request timeout must be greater than 0 seconds.",
            ));
        }

        Ok(())
    }
}

impl Settings {
    /// Validate all configuration settings
    ///
    /// Returns the first validation error encountered. The database section
    /// is only checked when the Postgres backend is selected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Postgres {
            self.database.validate()?;
        }
        self.logger.validate()?;
        self.dispatcher.validate()?;
        self.timeouts.validate()?;
        for provider in Provider::ALL {
            self.rate_limits.for_provider(provider).validate(provider)?;
            self.circuit_breakers.for_provider(provider).validate(provider)?;
        }
        self.persistence.validate()?;
        self.reaper.validate()?;
        self.handlers.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::{ConsoleSettings, StoreConfig};

    fn valid_settings() -> Settings {
        let mut settings = Settings::default();
        settings.database.url = "postgres://localhost/jobguard".to_string();
        settings
    }

    fn assert_field(result: Result<(), ConfigError>, expected: &str) {
        match result {
            Err(ConfigError::ValidationError { field, .. }) => assert_eq!(field, expected),
            other => panic!("Expected ValidationError for {}, got {:?}", expected, other),
        }
    }

    #[test]
    fn test_settings_valid() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn test_memory_backend_skips_database() {
        let settings = Settings {
            store: StoreConfig {
                backend: StoreBackend::Memory,
            },
            ..Settings::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_database_config_empty_url() {
        assert_field(Settings::default().validate(), "database.url");
    }

    #[test]
    fn test_database_config_rejects_non_postgres() {
        let config = DatabaseConfig {
            url: "mysql://localhost/db".to_string(),
            ..Default::default()
        };
        assert_field(config.validate(), "database.url");

        let config = DatabaseConfig {
            url: "postgresql://localhost/db".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_config_min_exceeds_max() {
        let config = DatabaseConfig {
            url: "postgres://localhost/db".to_string(),
            max_connections: 2,
            min_connections: 5,
            ..Default::default()
        };
        assert_field(config.validate(), "database.min_connections");
    }

    #[test]
    fn test_logger_level_with_directives() {
        let settings = LoggerSettings {
            level: "warn,jobguard::jobs=debug".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());

        let settings = LoggerSettings {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert_field(settings.validate(), "logger.level");
    }

    #[test]
    fn test_logger_requires_an_output() {
        let settings = LoggerSettings {
            console: ConsoleSettings {
                enabled: false,
                colored: false,
            },
            ..Default::default()
        };
        assert_field(settings.validate(), "logger");
    }

    #[test]
    fn test_logger_file_enabled_empty_path() {
        let mut settings = LoggerSettings::default();
        settings.file.enabled = true;
        settings.file.path = "  ".to_string();
        assert_field(settings.validate(), "logger.file.path");
    }

    #[test]
    fn test_dispatcher_rejects_zero_workers() {
        let mut settings = valid_settings();
        settings.dispatcher.workers = 0;
        assert_field(settings.validate(), "dispatcher.workers");
    }

    #[test]
    fn test_dispatcher_rejects_shrinking_backoff() {
        let mut settings = valid_settings();
        settings.dispatcher.backoff_multiplier = 0.5;
        assert_field(settings.validate(), "dispatcher.backoff_multiplier");

        let mut settings = valid_settings();
        settings.dispatcher.backoff_base_secs = 700;
        assert_field(settings.validate(), "dispatcher.backoff_base_secs");
    }

    #[test]
    fn test_timeouts_reject_zero_entry() {
        let mut settings = valid_settings();
        settings.timeouts.market_data_sync_secs = Some(0);
        assert_field(settings.validate(), "timeouts.market_data_sync_secs");
    }

    #[test]
    fn test_rate_limit_fields_are_provider_scoped() {
        let mut settings = valid_settings();
        settings.rate_limits.market_data.refill_per_minute = 0.0;
        assert_field(settings.validate(), "rate_limits.market_data.refill_per_minute");

        let mut settings = valid_settings();
        settings.rate_limits.catalog.jitter_ratio = 1.5;
        assert_field(settings.validate(), "rate_limits.catalog.jitter_ratio");
    }

    #[test]
    fn test_rate_limit_capacity_holds_a_whole_token() {
        let mut settings = valid_settings();
        settings.rate_limits.catalog.capacity = 0.5;
        assert_field(settings.validate(), "rate_limits.catalog.capacity");

        let mut settings = valid_settings();
        settings.rate_limits.catalog.capacity = 1.0;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_circuit_breaker_thresholds() {
        let mut settings = valid_settings();
        settings.circuit_breakers.catalog.success_threshold = 0;
        assert_field(settings.validate(), "circuit_breakers.catalog.success_threshold");
    }

    #[test]
    fn test_reaper_cron_needs_seconds_field() {
        let mut settings = valid_settings();
        settings.reaper.cron = "* * * * *".to_string();
        assert_field(settings.validate(), "reaper.cron");

        settings.reaper.enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_handler_url_scheme() {
        let mut settings = valid_settings();
        settings.handlers.price_publish_url = Some("ftp://pricing".to_string());
        assert_field(settings.validate(), "handlers.price_publish_url");

        settings.handlers.price_publish_url = Some("https://pricing.internal/publish".to_string());
        assert!(settings.validate().is_ok());
    }
}
