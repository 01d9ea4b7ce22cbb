use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use crate::jobs::error::JobError;
use crate::jobs::types::{JobContext, JobHandler, Provider};

/// Handler that delivers the job to an HTTP endpoint.
///
/// The endpoint receives `{job_id, job_type, attempt, input}` as JSON.
/// Responses map onto the retry taxonomy: 429 is a provider rejection,
/// 5xx and network errors are transient, other 4xx are permanent.
pub struct WebhookHandler {
    client: reqwest::Client,
    url: String,
    provider: Option<Provider>,
}

impl WebhookHandler {
    pub fn new(client: reqwest::Client, url: impl Into<String>, provider: Option<Provider>) -> Self {
        Self {
            client,
            url: url.into(),
            provider,
        }
    }

    fn rejection(&self, headers: &HeaderMap) -> JobError {
        let retry_after = parse_retry_after(headers, Timestamp::now());
        match self.provider {
            Some(provider) => JobError::ProviderRejected {
                provider,
                retry_after,
            },
            None => JobError::transient(format!("{} responded 429 Too Many Requests", self.url)),
        }
    }
}

/// Reads `Retry-After` as delta-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap, now: Timestamp) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = jiff::fmt::rfc2822::parse(value).ok()?.timestamp();
    let secs = at.duration_since(now).as_secs_f64().max(0.0);
    Duration::try_from_secs_f64(secs).ok()
}

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Option<JsonValue>, JobError> {
        let request = self
            .client
            .post(&self.url)
            .header("X-Job-Id", ctx.job_id.to_string())
            .header("X-Job-Attempt", ctx.attempt.to_string())
            .json(&json!({
                "job_id": ctx.job_id,
                "job_type": ctx.job_type,
                "attempt": ctx.attempt,
                "input": ctx.input,
            }));

        let response = tokio::select! {
            _ = ctx.cancellation_token.cancelled() => return Err(JobError::Cancelled),
            response = request.send() => response
                .map_err(|e| JobError::transient(format!("request to {} failed: {}", self.url, e)))?,
        };

        let status = response.status();
        debug!(job_id = %ctx.job_id, status = status.as_u16(), "Webhook responded");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(self.rejection(response.headers()));
        }
        if status.is_server_error() {
            return Err(JobError::transient(format!("{} responded {}", self.url, status)));
        }
        if !status.is_success() {
            return Err(JobError::permanent(format!("{} responded {}", self.url, status)));
        }

        let body = tokio::select! {
            _ = ctx.cancellation_token.cancelled() => return Err(JobError::Cancelled),
            body = response.bytes() => body
                .map_err(|e| JobError::transient(format!("reading response from {} failed: {}", self.url, e)))?,
        };

        if body.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice(&body) {
            Ok(JsonValue::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(_) => Ok(Some(JsonValue::String(
                String::from_utf8_lossy(&body).into_owned(),
            ))),
        }
    }

    fn description(&self) -> Option<String> {
        Some(format!("POST {}", self.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::jobs::types::JobType;

    fn ctx() -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            job_type: JobType::PricePublish,
            attempt: 1,
            input: json!({"sku": "A-1", "price": 9.99}),
            cancellation_token: CancellationToken::new(),
        }
    }

    async fn handler_for(server: &MockServer, status: u16) -> WebhookHandler {
        Mock::given(method("POST"))
            .and(path("/publish"))
            .and(header("X-Job-Attempt", "1"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({"published": true})))
            .mount(server)
            .await;
        WebhookHandler::new(
            reqwest::Client::new(),
            format!("{}/publish", server.uri()),
            Some(Provider::Catalog),
        )
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let server = MockServer::start().await;
        let handler = handler_for(&server, 200).await;
        assert_eq!(
            handler.handle(ctx()).await,
            Ok(Some(json!({"published": true})))
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        let handler = handler_for(&server, 503).await;
        assert!(matches!(
            handler.handle(ctx()).await,
            Err(JobError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let server = MockServer::start().await;
        let handler = handler_for(&server, 422).await;
        assert!(matches!(
            handler.handle(ctx()).await,
            Err(JobError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn test_too_many_requests_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;
        let handler = WebhookHandler::new(reqwest::Client::new(), server.uri(), Some(Provider::Catalog));

        assert_eq!(
            handler.handle(ctx()).await,
            Err(JobError::ProviderRejected {
                provider: Provider::Catalog,
                retry_after: Some(Duration::from_secs(12)),
            })
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        let handler = WebhookHandler::new(reqwest::Client::new(), server.uri(), None);

        let ctx = ctx();
        ctx.cancellation_token.cancel();
        assert_eq!(handler.handle(ctx).await, Err(JobError::Cancelled));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now: Timestamp = "2026-01-05T10:00:00Z".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Mon, 05 Jan 2026 10:01:30 GMT"),
        );
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(90)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }
}
