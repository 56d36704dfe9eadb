use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, extract::Request, http::StatusCode, response::Response};
use dashmap::DashMap;
use metrics::counter;
use tracing::{info, warn};

use crate::config::{BreakerKeySource, CircuitBreakerPolicyConfig};
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::pipeline::{Next, Policy};
use crate::stores::{CircuitBreakerStore, CircuitSnapshot, CircuitState};

/// Per-key failure-tracking state machine in front of the upstream.
///
/// State transitions live in the pluggable store; only half-open probe
/// admission is tracked locally, since concurrent probe counting is
/// meaningless across processes sharing an external store.
pub struct CircuitBreakerPolicy {
    name: String,
    priority: Option<i32>,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max: u32,
    failure_statuses: Vec<u16>,
    key_source: BreakerKeySource,
    store: Arc<dyn CircuitBreakerStore>,
    inflight_probes: DashMap<String, Arc<AtomicU32>>,
}

impl CircuitBreakerPolicy {
    pub fn new(config: CircuitBreakerPolicyConfig, store: Arc<dyn CircuitBreakerStore>) -> Self {
        Self {
            name: config.name.unwrap_or_else(|| "circuit_breaker".to_string()),
            priority: config.priority,
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout,
            half_open_max: config.half_open_max,
            failure_statuses: config.failure_statuses,
            key_source: config.key,
            store,
            inflight_probes: DashMap::new(),
        }
    }

    fn key(&self, ctx: &GatewayContext) -> String {
        match self.key_source {
            BreakerKeySource::Route => ctx.route_path.clone(),
            BreakerKeySource::ClientIp => ctx.client_ip.to_string(),
        }
    }

    fn is_failure_status(&self, status: StatusCode) -> bool {
        if self.failure_statuses.is_empty() {
            status.is_server_error()
        } else {
            self.failure_statuses.contains(&status.as_u16())
        }
    }

    /// Success/failure classification of one outcome. Cancellation is not
    /// ours to judge and is left out of the accounting.
    fn classify(&self, outcome: &Result<Response>) -> Option<bool> {
        match outcome {
            Ok(response) => Some(!self.is_failure_status(response.status())),
            Err(err) if err.is_cancelled() => None,
            Err(_) => Some(false),
        }
    }

    fn reject(&self, key: String, retry_after: u64) -> GatewayError {
        counter!("gateway_circuit_rejections_total", "key" => key.clone()).increment(1);
        GatewayError::CircuitOpen { key, retry_after }
    }

    async fn run_closed(
        &self,
        key: &str,
        req: Request<Body>,
        ctx: &mut GatewayContext,
        next: Next<'_>,
    ) -> Result<Response> {
        let outcome = next.run(req, ctx).await;
        match self.classify(&outcome) {
            Some(true) => {
                if let Err(e) = self.store.record_success(key).await {
                    warn!(key = %key, error = %e, "circuit breaker store unavailable on success");
                }
            }
            Some(false) => match self.store.record_failure(key).await {
                Ok(failures) if failures >= self.failure_threshold => {
                    warn!(
                        key = %key,
                        failures,
                        threshold = self.failure_threshold,
                        "failure threshold reached, opening circuit"
                    );
                    counter!("gateway_circuit_opened_total", "key" => key.to_string()).increment(1);
                    if let Err(e) = self.store.transition(key, CircuitState::Open).await {
                        warn!(key = %key, error = %e, "failed to open circuit");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "circuit breaker store unavailable on failure");
                }
            },
            None => {}
        }
        outcome
    }

    async fn run_probe(
        &self,
        key: &str,
        req: Request<Body>,
        ctx: &mut GatewayContext,
        next: Next<'_>,
    ) -> Result<Response> {
        let Some(_guard) = ProbeGuard::acquire(&self.inflight_probes, key, self.half_open_max)
        else {
            return Err(self.reject(key.to_string(), self.reset_timeout.as_secs().max(1)));
        };

        let outcome = next.run(req, ctx).await;
        match self.classify(&outcome) {
            Some(true) => {
                info!(key = %key, "half-open probe succeeded, closing circuit");
                if let Err(e) = self.store.transition(key, CircuitState::Closed).await {
                    warn!(key = %key, error = %e, "failed to close circuit");
                }
            }
            Some(false) => {
                warn!(key = %key, "half-open probe failed, reopening circuit");
                if let Err(e) = self.store.transition(key, CircuitState::Open).await {
                    warn!(key = %key, error = %e, "failed to reopen circuit");
                }
            }
            None => {}
        }
        outcome
    }
}

#[async_trait]
impl Policy for CircuitBreakerPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> Option<i32> {
        self.priority
    }

    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut GatewayContext,
        next: Next<'_>,
    ) -> Result<Response> {
        let key = self.key(ctx);

        // Store unavailability falls back to the default closed state
        // rather than failing the request.
        let snapshot = match self.store.state(&key).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(key = %key, error = %e, "circuit breaker store unavailable, failing open");
                CircuitSnapshot::default()
            }
        };

        match snapshot.state {
            CircuitState::Closed => self.run_closed(&key, req, ctx, next).await,
            CircuitState::Open => {
                let since_transition = snapshot.last_transition_at.elapsed();
                if since_transition < self.reset_timeout {
                    let retry_after =
                        (self.reset_timeout - since_transition).as_secs().max(1);
                    return Err(self.reject(key, retry_after));
                }
                if let Err(e) = self.store.transition(&key, CircuitState::HalfOpen).await {
                    warn!(key = %key, error = %e, "failed to half-open circuit");
                }
                self.run_probe(&key, req, ctx, next).await
            }
            CircuitState::HalfOpen => self.run_probe(&key, req, ctx, next).await,
        }
    }
}

/// RAII admission slot for one half-open probe.
struct ProbeGuard {
    counter: Arc<AtomicU32>,
}

impl ProbeGuard {
    fn acquire(
        inflight: &DashMap<String, Arc<AtomicU32>>,
        key: &str,
        max: u32,
    ) -> Option<Self> {
        let counter = inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();

        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match counter.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Self { counter }),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
