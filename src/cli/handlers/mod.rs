//! Command handlers for CLI operations
//!
//! This module contains handlers for different CLI commands,
//! separating command execution logic from parsing and validation.

pub mod admin;
pub mod migrate;
pub mod work;

pub use admin::AdminCommandHandler;
pub use migrate::MigrateCommandHandler;
pub use work::WorkCommandHandler;
