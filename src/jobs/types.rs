use std::time::Duration;

use async_trait::async_trait;
use diesel_derive_enum::DbEnum;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::error::JobError;

/// External resource a job calls; each one has its own rate limiter and breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Catalog,
    MarketData,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Catalog, Provider::MarketData];

    /// Name used for the persisted bucket row and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Catalog => "catalog",
            Provider::MarketData => "market_data",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of job kinds the dispatcher knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::JobType")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    PricePublish,
    CatalogSync,
    MarketDataSync,
    FeatureCompute,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::PricePublish,
        JobType::CatalogSync,
        JobType::MarketDataSync,
        JobType::FeatureCompute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::PricePublish => "price_publish",
            JobType::CatalogSync => "catalog_sync",
            JobType::MarketDataSync => "market_data_sync",
            JobType::FeatureCompute => "feature_compute",
        }
    }

    /// The guarded provider this job type calls, if any.
    pub fn provider(&self) -> Option<Provider> {
        match self {
            JobType::PricePublish | JobType::CatalogSync => Some(Provider::Catalog),
            JobType::MarketDataSync => Some(Provider::MarketData),
            JobType::FeatureCompute => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.to_lowercase())
            .ok_or_else(|| {
                format!(
                    "Invalid job type '{}'. Valid values are: price_publish, catalog_sync, market_data_sync, feature_compute",
                    s
                )
            })
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::JobStatus")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Execution context handed to a handler for one attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub attempt: i32,
    pub input: JsonValue,
    /// Cancelled when the attempt times out or the job is cancelled.
    pub cancellation_token: CancellationToken,
}

/// Trait that all job handlers must implement
///
/// Handlers must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt. The returned value is stored as the job result.
    async fn handle(&self, ctx: JobContext) -> Result<Option<JsonValue>, JobError>;

    /// Optional description
    fn description(&self) -> Option<String> {
        None
    }
}

/// Adds a duration to a timestamp, saturating at the maximum representable instant.
pub fn add_duration(ts: Timestamp, duration: Duration) -> Timestamp {
    ts.checked_add(duration).unwrap_or(Timestamp::MAX)
}
