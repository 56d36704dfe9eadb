pub mod memory;

pub use memory::{MemoryCacheStore, MemoryCircuitBreakerStore, MemoryRateLimitStore};

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use thiserror::Error;

/// Failure of a store backend.
///
/// Policies never surface these to the caller directly; each policy
/// documents its own fallback direction (rate limiter fails open, circuit
/// breaker falls back to closed).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time view of one breaker key.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<Instant>,
    pub last_transition_at: Instant,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_transition_at: Instant::now(),
        }
    }
}

/// Per-key circuit breaker state container.
///
/// Every read and transition goes through this trait so the breaker policy
/// works identically against the in-process map or an external shared
/// store. Implementations must make each operation atomic with respect to
/// concurrent callers on the same key.
#[async_trait]
pub trait CircuitBreakerStore: Send + Sync {
    async fn state(&self, key: &str) -> Result<CircuitSnapshot, StoreError>;
    async fn record_success(&self, key: &str) -> Result<(), StoreError>;
    /// Returns the failure count after the increment.
    async fn record_failure(&self, key: &str) -> Result<u32, StoreError>;
    async fn transition(&self, key: &str, state: CircuitState) -> Result<(), StoreError>;
    async fn reset(&self, key: &str) -> Result<(), StoreError>;
}

/// Fixed-window counter state for one key.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitWindow {
    pub count: u64,
    /// Unix seconds at which the window resets.
    pub reset_at: u64,
}

impl RateLimitWindow {
    /// Sentinel returned when the store refuses a new key at its
    /// cardinality ceiling; the effectively infinite count makes the
    /// caller reject the request.
    pub fn saturated(window: Duration) -> Self {
        Self {
            count: u64::MAX,
            reset_at: unix_now() + window.as_secs(),
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.count == u64::MAX
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increment the counter for `key`, starting a new window when the
    /// previous one expired.
    async fn increment(&self, key: &str, window: Duration) -> Result<RateLimitWindow, StoreError>;
}

/// Response retained by the caching policy.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError>;
    async fn put(
        &self,
        key: String,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
