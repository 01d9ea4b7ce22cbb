use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Builds the shared HTTP client used by webhook handlers.
///
/// One client per process keeps connection pooling effective across
/// handlers. Per-request deadlines are enforced by the job timeout; the
/// client timeout here is only an outer bound.
pub fn build_http_client(
    request_timeout: Duration,
    connect_timeout: Duration,
    user_agent: &str,
) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        // Timeouts
        .timeout(request_timeout)
        .connect_timeout(connect_timeout)
        // Connection pooling
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        // HTTP/2 settings
        .http2_adaptive_window(true)
        .http2_keep_alive_interval(Duration::from_secs(10))
        .http2_keep_alive_timeout(Duration::from_secs(20))
        .gzip(true)
        .use_rustls_tls()
        .user_agent(user_agent)
        .build()
        .map_err(|e| AppError::Configuration {
            key: "handlers".to_string(),
            source: anyhow::Error::from(e),
        })
}
