use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue},
    response::Response,
};
use metrics::counter;
use tracing::warn;

use crate::config::{RateLimitKeySource, RateLimitPolicyConfig};
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::pipeline::{Next, Policy};
use crate::stores::{unix_now, RateLimitStore};

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Fixed-window request counting per key.
///
/// Two opposite fallback directions apply deliberately: a store outage
/// fails open (a transient backend problem should not block all traffic),
/// while the store's cardinality ceiling fails closed via the saturated
/// sentinel (bounded memory beats availability against unbounded
/// unique-key growth).
pub struct RateLimitPolicy {
    name: String,
    priority: Option<i32>,
    max: u64,
    window: Duration,
    key_source: RateLimitKeySource,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimitPolicy {
    pub fn new(config: RateLimitPolicyConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            name: config.name.unwrap_or_else(|| "rate_limit".to_string()),
            priority: config.priority,
            max: config.max,
            window: config.window,
            key_source: config.key,
            store,
        }
    }

    fn key(&self, req: &Request<Body>, ctx: &GatewayContext) -> String {
        match self.key_source {
            RateLimitKeySource::Route => ctx.route_path.clone(),
            RateLimitKeySource::ClientIp => req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .unwrap_or_else(|| ctx.client_ip.to_string()),
        }
    }
}

#[async_trait]
impl Policy for RateLimitPolicy {
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
        let key = self.key(&req, ctx);

        let window = match self.store.increment(&key, self.window).await {
            Ok(window) => window,
            Err(e) => {
                warn!(key = %key, error = %e, "rate limit store unavailable, failing open");
                counter!("gateway_rate_limit_store_errors_total").increment(1);
                return next.run(req, ctx).await;
            }
        };

        if window.count > self.max {
            let retry_after = window.reset_at.saturating_sub(unix_now()).max(1);
            counter!("gateway_rate_limited_total", "key" => key.clone()).increment(1);
            return Err(GatewayError::RateLimited {
                key,
                limit: self.max,
                reset_at: window.reset_at,
                retry_after,
            });
        }

        let remaining = self.max - window.count;
        let mut response = next.run(req, ctx).await?;
        let headers = response.headers_mut();
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(self.max));
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
        headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(window.reset_at));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecMode;
    use crate::pipeline::testutil::{test_ctx, test_request, ScriptedDispatcher};
    use crate::stores::{MemoryRateLimitStore, RateLimitWindow, StoreError};

    fn chain(
        max: u64,
        window: Duration,
        store: Arc<dyn RateLimitStore>,
    ) -> Vec<Arc<dyn Policy>> {
        let config = RateLimitPolicyConfig {
            name: None,
            priority: None,
            max,
            window,
            key: RateLimitKeySource::ClientIp,
        };
        vec![Arc::new(RateLimitPolicy::new(config, store))]
    }

    #[tokio::test]
    async fn test_requests_over_the_limit_are_rejected() {
        let store = Arc::new(MemoryRateLimitStore::new(1024));
        let chain = chain(5, Duration::from_secs(60), store);
        let terminal = ScriptedDispatcher::new(&[200]);

        for i in 0..5u64 {
            let mut ctx = test_ctx(ExecMode::Fast);
            let response = Next::new(&chain, &terminal)
                .run(test_request(), &mut ctx)
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(
                response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .unwrap()
                    .to_str()
                    .unwrap(),
                (4 - i).to_string()
            );
            assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "5");
        }

        // The sixth call inside the window is rejected.
        let mut ctx = test_ctx(ExecMode::Fast);
        let err = Next::new(&chain, &terminal)
            .run(test_request(), &mut ctx)
            .await
            .unwrap_err();
        match err {
            GatewayError::RateLimited {
                limit, retry_after, ..
            } => {
                assert_eq!(limit, 5);
                assert!(retry_after >= 1);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(terminal.calls(), 5);
    }

    #[tokio::test]
    async fn test_window_expiry_resets_the_count() {
        let store = Arc::new(MemoryRateLimitStore::new(1024));
        let chain = chain(1, Duration::from_millis(40), store);
        let terminal = ScriptedDispatcher::new(&[200]);

        let mut ctx = test_ctx(ExecMode::Fast);
        Next::new(&chain, &terminal)
            .run(test_request(), &mut ctx)
            .await
            .unwrap();

        let mut ctx = test_ctx(ExecMode::Fast);
        assert!(Next::new(&chain, &terminal)
            .run(test_request(), &mut ctx)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut ctx = test_ctx(ExecMode::Fast);
        let response = Next::new(&chain, &terminal)
            .run(test_request(), &mut ctx)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
    }

    #[tokio::test]
    async fn test_forwarded_for_first_hop_is_the_key() {
        let store = Arc::new(MemoryRateLimitStore::new(1024));
        let chain = chain(1, Duration::from_secs(60), store);
        let terminal = ScriptedDispatcher::new(&[200]);

        let request = |ip: &str| {
            Request::builder()
                .uri("/api/test")
                .header("x-forwarded-for", format!("{ip}, 10.0.0.9"))
                .body(Body::empty())
                .unwrap()
        };

        let mut ctx = test_ctx(ExecMode::Fast);
        Next::new(&chain, &terminal)
            .run(request("203.0.113.7"), &mut ctx)
            .await
            .unwrap();

        // Same first hop exhausts its budget...
        let mut ctx = test_ctx(ExecMode::Fast);
        assert!(Next::new(&chain, &terminal)
            .run(request("203.0.113.7"), &mut ctx)
            .await
            .is_err());

        // ...while a different client is unaffected.
        let mut ctx = test_ctx(ExecMode::Fast);
        assert!(Next::new(&chain, &terminal)
            .run(request("203.0.113.8"), &mut ctx)
            .await
            .is_ok());
    }

    struct FailingStore;

    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn increment(
            &self,
            _key: &str,
            _window: Duration,
        ) -> std::result::Result<RateLimitWindow, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let chain = chain(1, Duration::from_secs(60), Arc::new(FailingStore));
        let terminal = ScriptedDispatcher::new(&[200]);

        for _ in 0..3 {
            let mut ctx = test_ctx(ExecMode::Fast);
            let response = Next::new(&chain, &terminal)
                .run(test_request(), &mut ctx)
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
        }
        assert_eq!(terminal.calls(), 3);
    }

    #[tokio::test]
    async fn test_cardinality_ceiling_fails_closed() {
        let store = Arc::new(MemoryRateLimitStore::new(1));
        let chain = chain(100, Duration::from_secs(60), store);
        let terminal = ScriptedDispatcher::new(&[200]);

        let request = |ip: &str| {
            Request::builder()
                .uri("/api/test")
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };

        // First key occupies the only slot and is fine.
        let mut ctx = test_ctx(ExecMode::Fast);
        assert!(Next::new(&chain, &terminal)
            .run(request("203.0.113.1"), &mut ctx)
            .await
            .is_ok());

        // A new key at capacity is rejected even though the limit itself
        // is far from reached.
        let mut ctx = test_ctx(ExecMode::Fast);
        let err = Next::new(&chain, &terminal)
            .run(request("203.0.113.2"), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(terminal.calls(), 1);
    }
}
