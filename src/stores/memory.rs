use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{
    unix_now, CacheStore, CachedResponse, CircuitBreakerStore, CircuitSnapshot, CircuitState,
    RateLimitStore, RateLimitWindow, StoreError,
};

/// In-process circuit breaker state, one entry per key.
#[derive(Default)]
pub struct MemoryCircuitBreakerStore {
    entries: DashMap<String, CircuitSnapshot>,
}

impl MemoryCircuitBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircuitBreakerStore for MemoryCircuitBreakerStore {
    async fn state(&self, key: &str) -> Result<CircuitSnapshot, StoreError> {
        Ok(self
            .entries
            .get(key)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn record_success(&self, key: &str) -> Result<(), StoreError> {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        entry.failure_count = 0;
        entry.last_failure_at = None;
        entry.success_count = entry.success_count.saturating_add(1);
        Ok(())
    }

    async fn record_failure(&self, key: &str) -> Result<u32, StoreError> {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure_at = Some(Instant::now());
        Ok(entry.failure_count)
    }

    async fn transition(&self, key: &str, state: CircuitState) -> Result<(), StoreError> {
        let mut entry = self.entries.entry(key.to_string()).or_default();
        if entry.state != state {
            debug!(key = %key, from = %entry.state, to = %state, "circuit transition");
        }
        entry.state = state;
        entry.last_transition_at = Instant::now();
        if state == CircuitState::Closed {
            entry.failure_count = 0;
            entry.success_count = 0;
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

struct WindowSlot {
    count: u64,
    expires_at: Instant,
    reset_at: u64,
}

impl WindowSlot {
    fn fresh(window: Duration) -> Self {
        Self {
            count: 0,
            expires_at: Instant::now() + window,
            reset_at: unix_now() + window.as_secs(),
        }
    }
}

/// Fixed-window rate limit counters with a bounded key cardinality.
///
/// When the map is full and a new key arrives, the store answers with the
/// saturated sentinel instead of admitting the key: bounded memory takes
/// priority over availability when unique keys grow without bound.
pub struct MemoryRateLimitStore {
    windows: Arc<DashMap<String, WindowSlot>>,
    max_keys: usize,
}

impl MemoryRateLimitStore {
    pub fn new(max_keys: usize) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_keys,
        }
    }

    /// Periodically evict expired windows so abandoned keys free their
    /// slots before the cardinality ceiling is felt.
    pub fn start_sweeper(&self, interval: Duration) {
        let windows = self.windows.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let before = windows.len();
                let now = Instant::now();
                windows.retain(|_, slot| slot.expires_at > now);
                let evicted = before - windows.len();
                if evicted > 0 {
                    debug!(evicted, remaining = windows.len(), "swept rate limit windows");
                }
            }
        });
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<RateLimitWindow, StoreError> {
        if !self.windows.contains_key(key) && self.windows.len() >= self.max_keys {
            warn!(
                key = %key,
                max_keys = self.max_keys,
                "rate limit store at capacity, rejecting new key"
            );
            return Ok(RateLimitWindow::saturated(window));
        }

        let mut slot = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowSlot::fresh(window));
        if slot.expires_at <= Instant::now() {
            *slot = WindowSlot::fresh(window);
        }
        slot.count += 1;

        Ok(RateLimitWindow {
            count: slot.count,
            reset_at: slot.reset_at,
        })
    }
}

struct CacheEntry {
    response: CachedResponse,
    created_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// In-process response cache with TTL expiry and LRU-order eviction.
pub struct MemoryCacheStore {
    entries: Arc<DashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries,
        }
    }

    pub fn start_sweeper(&self, interval: Duration) {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let before = entries.len();
                entries.retain(|_, entry| !entry.is_expired());
                let expired = before - entries.len();
                if expired > 0 {
                    debug!(expired, remaining = entries.len(), "swept expired cache entries");
                }
            }
        });
    }

    fn evict_least_recently_used(&self) {
        let mut oldest: Option<(String, Instant)> = None;
        for entry in self.entries.iter() {
            match &oldest {
                Some((_, accessed)) if entry.last_accessed >= *accessed => {}
                _ => oldest = Some((entry.key().clone(), entry.last_accessed)),
            }
        }
        if let Some((key, _)) = oldest {
            self.entries.remove(&key);
            debug!(key = %key, "evicted least recently used cache entry");
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        entry.last_accessed = Instant::now();
        Ok(Some(entry.response.clone()))
    }

    async fn put(
        &self,
        key: String,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_least_recently_used();
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                response,
                created_at: now,
                ttl,
                last_accessed: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
