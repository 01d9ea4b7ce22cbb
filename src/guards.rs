//! Owner of the per-provider rate limiters and circuit breakers.
//!
//! Built once by the composition root and handed to the dispatcher; no
//! guard lives in global state.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::config::Settings;
use crate::jobs::types::Provider;
use crate::ratelimit::{
    BucketPersister, PersistStats, ProviderRateLimiter, RateLimitPolicy, RateLimiterSnapshot,
};

/// Rate limiter and circuit breaker for one provider.
#[derive(Debug, Clone)]
pub struct ProviderGuards {
    pub limiter: Arc<ProviderRateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
}

impl ProviderGuards {
    fn new(
        provider: Provider,
        policy: RateLimitPolicy,
        circuit: CircuitBreakerConfig,
        persister: Option<BucketPersister>,
    ) -> Self {
        Self {
            limiter: Arc::new(ProviderRateLimiter::new(provider, policy, persister)),
            breaker: Arc::new(CircuitBreaker::new(provider, circuit)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardDiagnostics {
    pub rate_limiters: Vec<RateLimiterSnapshot>,
    pub circuits: Vec<CircuitSnapshot>,
    pub persistence: Option<PersistStats>,
}

#[derive(Debug, Clone)]
pub struct GuardRegistry {
    catalog: ProviderGuards,
    market_data: ProviderGuards,
    persister: Option<BucketPersister>,
}

impl GuardRegistry {
    pub fn new<R, C>(rate_limit: R, circuit: C, persister: Option<BucketPersister>) -> Self
    where
        R: Fn(Provider) -> RateLimitPolicy,
        C: Fn(Provider) -> CircuitBreakerConfig,
    {
        let build = |provider: Provider| {
            ProviderGuards::new(
                provider,
                rate_limit(provider),
                circuit(provider),
                persister.clone(),
            )
        };

        Self {
            catalog: build(Provider::Catalog),
            market_data: build(Provider::MarketData),
            persister,
        }
    }

    pub fn from_settings(settings: &Settings, persister: Option<BucketPersister>) -> Self {
        Self::new(
            |provider| settings.rate_limits.for_provider(provider).policy(),
            |provider| settings.circuit_breakers.for_provider(provider).config(),
            persister,
        )
    }

    pub fn for_provider(&self, provider: Provider) -> &ProviderGuards {
        match provider {
            Provider::Catalog => &self.catalog,
            Provider::MarketData => &self.market_data,
        }
    }

    pub fn limiter(&self, provider: Provider) -> &Arc<ProviderRateLimiter> {
        &self.for_provider(provider).limiter
    }

    pub fn breaker(&self, provider: Provider) -> &Arc<CircuitBreaker> {
        &self.for_provider(provider).breaker
    }

    pub fn diagnostics(&self) -> GuardDiagnostics {
        GuardDiagnostics {
            rate_limiters: Provider::ALL
                .iter()
                .map(|p| self.limiter(*p).snapshot())
                .collect(),
            circuits: Provider::ALL
                .iter()
                .map(|p| self.breaker(*p).state())
                .collect(),
            persistence: self.persister.as_ref().map(BucketPersister::stats),
        }
    }

    pub fn log_diagnostics(&self) {
        let diagnostics = self.diagnostics();
        for (limiter, circuit) in diagnostics.rate_limiters.iter().zip(&diagnostics.circuits) {
            debug!(
                provider = %limiter.provider,
                tokens = limiter.bucket.tokens,
                capacity = limiter.bucket.capacity,
                rejections = limiter.consecutive_rejections,
                circuit = %circuit.status,
                failures = circuit.failure_count,
                "Guard state"
            );
        }
        if let Some(stats) = diagnostics.persistence {
            debug!(
                submitted = stats.submitted,
                written = stats.written,
                dropped = stats.dropped,
                failed = stats.failed,
                "Bucket persistence"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitStatus;

    #[test]
    fn test_guards_are_per_provider() {
        let registry = GuardRegistry::from_settings(&Settings::default(), None);

        let catalog = registry.limiter(Provider::Catalog);
        let market = registry.limiter(Provider::MarketData);
        assert_eq!(catalog.provider(), Provider::Catalog);
        assert_eq!(market.provider(), Provider::MarketData);
        assert!(!Arc::ptr_eq(
            registry.breaker(Provider::Catalog),
            registry.breaker(Provider::MarketData)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostics_cover_all_providers() {
        let registry = GuardRegistry::new(
            |_| RateLimitPolicy::default(),
            |_| CircuitBreakerConfig::default(),
            None,
        );
        registry.breaker(Provider::MarketData).reset();

        let diagnostics = registry.diagnostics();
        assert_eq!(diagnostics.rate_limiters.len(), Provider::ALL.len());
        assert_eq!(diagnostics.circuits.len(), Provider::ALL.len());
        assert!(diagnostics
            .circuits
            .iter()
            .all(|c| c.status == CircuitStatus::Closed));
        assert!(diagnostics.persistence.is_none());
    }

    #[tokio::test]
    async fn test_registry_with_persister_is_debug() {
        let (persister, handle) = BucketPersister::spawn(
            Arc::new(crate::repositories::MemoryBucketStore::new()),
            crate::ratelimit::PersistPolicy::default(),
        );
        let registry = GuardRegistry::from_settings(&Settings::default(), Some(persister));

        let debug = format!("{:?}", registry);
        assert!(debug.contains("BucketPersister"));

        drop(registry);
        handle.await.unwrap();
    }
}
