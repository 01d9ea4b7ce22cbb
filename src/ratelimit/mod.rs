//! Provider rate limiting: token buckets, per-provider limiters and
//! best-effort persistence of bucket state across restarts.

pub mod bucket;
pub mod persistence;
pub mod provider;

pub use bucket::{BucketRecord, BucketSnapshot, TokenBucket};
pub use persistence::{BucketPersister, PersistPolicy, PersistStats};
pub use provider::{ProviderRateLimiter, RateLimitPolicy, RateLimiterSnapshot};
