//! CLI argument validation functions
//!
//! This module provides custom validation functions for CLI arguments
//! that go beyond what clap can validate automatically.

use std::fs;
use std::path::PathBuf;

use serde_json::Value as JsonValue;

use super::handlers::migrate::MAX_ROLLBACK_STEPS;
use crate::jobs::{MAX_PRIORITY, MIN_PRIORITY};

/// Upper bound on `work --workers`.
const MAX_WORKERS: usize = 256;

/// Validate that a file path is accessible (exists and is readable)
pub fn validate_config_file_path(path_str: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(format!("Configuration file does not exist: '{}'", path_str));
    }

    if !path.is_file() {
        return Err(format!("Configuration path is not a file: '{}'", path_str));
    }

    match fs::File::open(&path) {
        Ok(_) => Ok(path),
        Err(e) => Err(format!("Cannot read configuration file '{}': {}", path_str, e)),
    }
}

/// Validate rollback steps is a positive number
pub fn validate_rollback_steps(steps_str: &str) -> Result<u32, String> {
    let steps: u32 = steps_str.parse().map_err(|_| {
        format!(
            "Rollback steps must be a valid positive number, got: '{}'",
            steps_str
        )
    })?;

    if steps == 0 {
        return Err("Rollback steps must be greater than 0".to_string());
    }

    if steps > MAX_ROLLBACK_STEPS {
        return Err(format!(
            "Rollback steps cannot exceed {} for safety reasons",
            MAX_ROLLBACK_STEPS
        ));
    }

    Ok(steps)
}

pub fn validate_workers(workers_str: &str) -> Result<usize, String> {
    let workers: usize = workers_str
        .parse()
        .map_err(|_| format!("Workers must be a positive number, got: '{}'", workers_str))?;

    if workers == 0 || workers > MAX_WORKERS {
        return Err(format!("Workers must be between 1 and {}", MAX_WORKERS));
    }

    Ok(workers)
}

pub fn validate_priority(priority_str: &str) -> Result<i16, String> {
    let priority: i16 = priority_str
        .parse()
        .map_err(|_| format!("Priority must be a number, got: '{}'", priority_str))?;

    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(format!(
            "Priority must be between {} and {}, got: {}",
            MIN_PRIORITY, MAX_PRIORITY, priority
        ));
    }

    Ok(priority)
}

pub fn validate_max_attempts(attempts_str: &str) -> Result<i32, String> {
    let attempts: i32 = attempts_str
        .parse()
        .map_err(|_| format!("Max attempts must be a number, got: '{}'", attempts_str))?;

    if attempts < 1 {
        return Err("Max attempts must be at least 1".to_string());
    }

    Ok(attempts)
}

/// Parse job input, which must be a JSON document
pub fn validate_json_input(input: &str) -> Result<JsonValue, String> {
    serde_json::from_str(input).map_err(|e| format!("Input is not valid JSON: {}", e))
}
