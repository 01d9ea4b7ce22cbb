use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::jobs::error::JobError;
use crate::jobs::types::Provider;
use crate::ratelimit::bucket::{BucketSnapshot, TokenBucket};
use crate::ratelimit::persistence::BucketPersister;

/// Tuning for one provider's limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    pub penalty_step: Duration,
    pub max_penalty: Duration,
    pub max_consecutive_rejections: u32,
    /// Fraction of the computed wait added as random jitter.
    pub jitter_ratio: f64,
    pub max_batch_size: Option<usize>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_rate: 20.0 / 60.0,
            penalty_step: Duration::from_secs(30),
            max_penalty: Duration::from_secs(300),
            max_consecutive_rejections: 5,
            jitter_ratio: 0.05,
            max_batch_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterSnapshot {
    pub provider: Provider,
    pub bucket: BucketSnapshot,
    pub consecutive_rejections: u32,
}

/// Rate limiter for one external provider.
///
/// Lazily restores the persisted bucket on first use and pushes a snapshot
/// to the background persister after every acquisition and rejection.
pub struct ProviderRateLimiter {
    provider: Provider,
    bucket: TokenBucket,
    policy: RateLimitPolicy,
    persister: Option<BucketPersister>,
    loaded: OnceCell<()>,
    consecutive_rejections: AtomicU32,
}

impl ProviderRateLimiter {
    pub fn new(
        provider: Provider,
        policy: RateLimitPolicy,
        persister: Option<BucketPersister>,
    ) -> Self {
        Self {
            provider,
            bucket: TokenBucket::new(provider.as_str(), policy.capacity, policy.refill_rate),
            policy,
            persister,
            loaded: OnceCell::new(),
            consecutive_rejections: AtomicU32::new(0),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    async fn ensure_loaded(&self) {
        let Some(persister) = &self.persister else {
            return;
        };
        self.loaded
            .get_or_init(|| async {
                match persister.load(self.provider.as_str()).await {
                    Ok(Some(record)) => {
                        self.bucket.restore(record.tokens, record.last_refill_time);
                        debug!(
                            provider = %self.provider,
                            tokens = self.bucket.available(),
                            "Restored persisted rate limit bucket"
                        );
                    }
                    Ok(None) => {
                        debug!(provider = %self.provider, "No persisted bucket, starting full");
                    }
                    Err(e) => {
                        warn!(
                            provider = %self.provider,
                            error = %e,
                            "Failed to load persisted bucket, starting full"
                        );
                    }
                }
            })
            .await;
    }

    fn persist(&self) {
        if let Some(persister) = &self.persister {
            persister.submit(self.bucket.record());
        }
    }

    /// Acquires tokens, waiting at most `max_wait`.
    pub async fn acquire(&self, tokens: f64, max_wait: Duration) -> Result<(), JobError> {
        self.ensure_loaded().await;

        if self.bucket.acquire(tokens, max_wait).await {
            self.persist();
            Ok(())
        } else {
            let wait = self.bucket.wait_time(tokens);
            if wait == Duration::MAX {
                warn!(
                    provider = %self.provider,
                    tokens,
                    capacity = self.bucket.capacity(),
                    "Requested tokens can never become available"
                );
                return Err(JobError::Permanent(format!(
                    "Rate limiter for {} can never supply {} tokens (capacity {})",
                    self.provider,
                    tokens,
                    self.bucket.capacity()
                )));
            }
            debug!(
                provider = %self.provider,
                wait_ms = wait.as_millis() as u64,
                "Rate limit exhausted"
            );
            Err(JobError::RateExhausted {
                provider: self.provider,
                wait,
            })
        }
    }

    pub async fn try_acquire(&self, tokens: f64) -> bool {
        self.ensure_loaded().await;
        let acquired = self.bucket.try_acquire(tokens);
        if acquired {
            self.persist();
        }
        acquired
    }

    pub fn record_success(&self) {
        self.consecutive_rejections.store(0, Ordering::SeqCst);
    }

    /// Handles an explicit "too many requests" answer from the provider.
    ///
    /// Empties the bucket and returns how long to back off, or
    /// `RejectionLimitReached` once the consecutive-rejection cap is exceeded.
    pub fn record_rejection(&self, retry_hint: Option<Duration>) -> Result<Duration, JobError> {
        self.bucket.drain();
        let rejections = self.consecutive_rejections.fetch_add(1, Ordering::SeqCst) + 1;
        self.persist();

        if rejections > self.policy.max_consecutive_rejections {
            warn!(
                provider = %self.provider,
                rejections,
                "Provider rejection limit reached"
            );
            return Err(JobError::RejectionLimitReached {
                provider: self.provider,
                rejections,
            });
        }

        let base = match retry_hint {
            Some(hint) => hint,
            None => self
                .bucket
                .full_refill_period()
                .saturating_add(self.penalty(rejections)),
        };
        let wait = base.saturating_add(self.jitter(base));

        warn!(
            provider = %self.provider,
            rejections,
            wait_ms = wait.as_millis() as u64,
            "Provider rejected request, backing off"
        );
        Ok(wait)
    }

    fn penalty(&self, rejections: u32) -> Duration {
        self.policy
            .penalty_step
            .saturating_mul(rejections)
            .min(self.policy.max_penalty)
    }

    fn jitter(&self, base: Duration) -> Duration {
        let max = base.as_secs_f64() * self.policy.jitter_ratio;
        if !max.is_finite() || max <= 0.0 {
            return Duration::ZERO;
        }
        let secs = rand::rng().random_range(0.0..=max);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// Batch size that fits the tokens available now.
    ///
    /// With no tokens at all, the full batch is returned: the caller will
    /// block on `acquire` anyway and should not shrink the request to nothing.
    pub async fn optimal_batch_size(&self, desired: usize) -> usize {
        self.ensure_loaded().await;
        let max_batch = self.policy.max_batch_size.unwrap_or(desired).max(1);
        let desired = desired.clamp(1, max_batch);
        let available = self.bucket.available().floor() as usize;

        if available >= desired {
            desired
        } else if available > 0 {
            available
        } else {
            max_batch
        }
    }

    pub fn consecutive_rejections(&self) -> u32 {
        self.consecutive_rejections.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            provider: self.provider,
            bucket: self.bucket.snapshot(),
            consecutive_rejections: self.consecutive_rejections(),
        }
    }
}

impl std::fmt::Debug for ProviderRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRateLimiter")
            .field("provider", &self.provider)
            .field("bucket", &self.bucket)
            .field("consecutive_rejections", &self.consecutive_rejections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jiff::Timestamp;

    use crate::ratelimit::bucket::BucketRecord;
    use crate::ratelimit::persistence::PersistPolicy;
    use crate::repositories::{BucketStore, MemoryBucketStore};

    fn policy(capacity: f64, per_minute: f64) -> RateLimitPolicy {
        RateLimitPolicy {
            capacity,
            refill_rate: per_minute / 60.0,
            jitter_ratio: 0.0,
            ..RateLimitPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_exhausted_returns_rate_exhausted() {
        let limiter = ProviderRateLimiter::new(Provider::Catalog, policy(2.0, 2.0), None);
        assert!(limiter.acquire(1.0, Duration::ZERO).await.is_ok());
        assert!(limiter.acquire(1.0, Duration::ZERO).await.is_ok());

        match limiter.acquire(1.0, Duration::from_secs(1)).await {
            Err(JobError::RateExhausted { provider, wait }) => {
                assert_eq!(provider, Provider::Catalog);
                assert_eq!(wait, Duration::from_secs(30));
            }
            other => panic!("expected RateExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_penalty_grows_and_caps() {
        let limiter = ProviderRateLimiter::new(Provider::Catalog, policy(20.0, 20.0), None);

        // full refill is 60s, penalty 30s per consecutive rejection
        assert_eq!(limiter.record_rejection(None), Ok(Duration::from_secs(90)));
        assert_eq!(limiter.record_rejection(None), Ok(Duration::from_secs(120)));
        assert_eq!(limiter.consecutive_rejections(), 2);
        assert_eq!(limiter.snapshot().bucket.tokens, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_penalty_is_capped() {
        let mut policy = policy(20.0, 20.0);
        policy.max_consecutive_rejections = 20;
        let limiter = ProviderRateLimiter::new(Provider::Catalog, policy, None);

        let mut last = Duration::ZERO;
        for _ in 0..15 {
            last = limiter.record_rejection(None).unwrap();
        }
        assert_eq!(last, Duration::from_secs(60 + 300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_uses_retry_hint() {
        let limiter = ProviderRateLimiter::new(Provider::MarketData, policy(20.0, 20.0), None);
        assert_eq!(
            limiter.record_rejection(Some(Duration::from_secs(7))),
            Ok(Duration::from_secs(7))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_jitter_is_bounded() {
        let mut policy = policy(20.0, 20.0);
        policy.jitter_ratio = 0.05;
        let limiter = ProviderRateLimiter::new(Provider::Catalog, policy, None);

        let wait = limiter.record_rejection(Some(Duration::from_secs(100))).unwrap();
        assert!(wait >= Duration::from_secs(100));
        assert!(wait <= Duration::from_secs(105));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_limit_reached() {
        let limiter = ProviderRateLimiter::new(Provider::Catalog, policy(20.0, 20.0), None);
        for _ in 0..5 {
            assert!(limiter.record_rejection(None).is_ok());
        }
        assert_eq!(
            limiter.record_rejection(None),
            Err(JobError::RejectionLimitReached {
                provider: Provider::Catalog,
                rejections: 6
            })
        );

        limiter.record_success();
        assert_eq!(limiter.consecutive_rejections(), 0);
        assert!(limiter.record_rejection(None).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimal_batch_size() {
        let mut policy = policy(100.0, 60.0);
        policy.max_batch_size = Some(50);
        let limiter = ProviderRateLimiter::new(Provider::MarketData, policy, None);

        assert_eq!(limiter.optimal_batch_size(80).await, 50);
        assert_eq!(limiter.optimal_batch_size(10).await, 10);

        assert!(limiter.try_acquire(93.0).await);
        assert_eq!(limiter.optimal_batch_size(10).await, 7);

        limiter.record_rejection(None).unwrap();
        assert_eq!(limiter.optimal_batch_size(10).await, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimal_batch_size_reads_persisted_tokens() {
        let store = Arc::new(MemoryBucketStore::new());
        store
            .save(BucketRecord {
                name: "market_data".to_string(),
                tokens: 4.0,
                last_refill_time: Timestamp::now(),
            })
            .await
            .unwrap();

        let (persister, _handle) = BucketPersister::spawn(store.clone(), PersistPolicy::default());
        let mut policy = policy(100.0, 60.0);
        policy.max_batch_size = Some(50);
        let limiter = ProviderRateLimiter::new(Provider::MarketData, policy, Some(persister));

        assert_eq!(limiter.optimal_batch_size(10).await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_capacity_is_permanent() {
        let limiter = ProviderRateLimiter::new(Provider::Catalog, policy(0.5, 60.0), None);

        match limiter.acquire(1.0, Duration::from_secs(5)).await {
            Err(JobError::Permanent(message)) => assert!(message.contains("catalog")),
            other => panic!("expected Permanent, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_persisted_state_once() {
        let store = Arc::new(MemoryBucketStore::new());
        store
            .save(BucketRecord {
                name: "catalog".to_string(),
                tokens: 0.0,
                last_refill_time: Timestamp::now(),
            })
            .await
            .unwrap();

        let (persister, _handle) = BucketPersister::spawn(store.clone(), PersistPolicy::default());
        let limiter =
            ProviderRateLimiter::new(Provider::Catalog, policy(20.0, 20.0), Some(persister));

        assert!(limiter.acquire(1.0, Duration::ZERO).await.is_err());
        assert!(!limiter.try_acquire(1.0).await);
    }
}
