//! Jobguard library
//!
//! Durable job dispatching with per-provider rate limiting, circuit
//! breaking, timeouts, retries and a dead letter queue.

use shadow_rs::shadow;
shadow!(build);

pub mod circuit;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod external;
pub mod guards;
pub mod jobs;
pub mod logger;
pub mod ratelimit;
pub mod repositories;
pub mod schema;
pub mod server;
pub mod state;

pub use state::AppState;

pub fn pkg_version() -> &'static str {
    build::PKG_VERSION
}

pub fn clap_long_version() -> &'static str {
    build::CLAP_LONG_VERSION
}
