pub mod cache;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;
pub mod timeout;

pub use cache::CachePolicy;
pub use circuit_breaker::CircuitBreakerPolicy;
pub use rate_limit::RateLimitPolicy;
pub use retry::RetryPolicy;
pub use timeout::TimeoutPolicy;

use std::sync::Arc;

use anyhow::Result;

use crate::config::PolicySpec;
use crate::pipeline::Policy;
use crate::stores::{CacheStore, CircuitBreakerStore, RateLimitStore};
use crate::upstream::Transport;

/// Shared dependencies handed to policy constructors.
pub struct PolicyDeps {
    pub transport: Arc<dyn Transport>,
    pub breaker_store: Arc<dyn CircuitBreakerStore>,
    pub rate_store: Arc<dyn RateLimitStore>,
    pub cache_store: Arc<dyn CacheStore>,
}

/// Build one policy instance from its configuration.
pub fn build_policy(spec: &PolicySpec, deps: &PolicyDeps) -> Result<Arc<dyn Policy>> {
    Ok(match spec {
        PolicySpec::RateLimit(config) => Arc::new(RateLimitPolicy::new(
            config.clone(),
            deps.rate_store.clone(),
        )),
        PolicySpec::CircuitBreaker(config) => Arc::new(CircuitBreakerPolicy::new(
            config.clone(),
            deps.breaker_store.clone(),
        )),
        PolicySpec::Retry(config) => Arc::new(RetryPolicy::new(
            config.clone(),
            deps.transport.clone(),
        )?),
        PolicySpec::Timeout(config) => Arc::new(TimeoutPolicy::new(config.clone())),
        PolicySpec::Cache(config) => Arc::new(CachePolicy::new(
            config.clone(),
            deps.cache_store.clone(),
        )),
    })
}
