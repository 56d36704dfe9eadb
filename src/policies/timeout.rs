use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, extract::Request, response::Response};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TimeoutPolicyConfig;
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::pipeline::{Next, Policy};

/// Races the continuation against a deadline.
///
/// The cancellation token goes onto the context so the upstream transport
/// can observe it; the token is advisory and scoped to this one request.
/// On expiry the token fires, the continuation is dropped, and the
/// distinct timeout error is returned; the error boundary converts only
/// that error kind into the configured timeout response.
pub struct TimeoutPolicy {
    name: String,
    priority: Option<i32>,
    timeout: Duration,
    status: u16,
}

impl TimeoutPolicy {
    pub fn new(config: TimeoutPolicyConfig) -> Self {
        Self {
            name: config.name.unwrap_or_else(|| "timeout".to_string()),
            priority: config.priority,
            timeout: config.timeout,
            status: config.status,
        }
    }
}

#[async_trait]
impl Policy for TimeoutPolicy {
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
        let token = CancellationToken::new();
        ctx.cancellation = Some(token.clone());

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        // Normal completion drops the pinned timer with the select.
        tokio::select! {
            outcome = next.run(req, ctx) => outcome,
            _ = &mut deadline => {
                token.cancel();
                debug!(timeout_ms = self.timeout.as_millis() as u64, "deadline expired");
                counter!("gateway_timeouts_total").increment(1);
                Err(GatewayError::UpstreamTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                    status: self.status,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecMode;
    use crate::pipeline::testutil::{test_ctx, test_request, ScriptedDispatcher, SlowDispatcher};
    use crate::upstream::Dispatcher;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn chain(timeout: Duration, status: u16) -> Vec<Arc<dyn Policy>> {
        let config = TimeoutPolicyConfig {
            name: None,
            priority: None,
            timeout,
            status,
        };
        vec![Arc::new(TimeoutPolicy::new(config))]
    }

    #[tokio::test]
    async fn test_slow_continuation_yields_timeout_not_late_result() {
        let chain = chain(Duration::from_millis(50), 504);
        let terminal = SlowDispatcher {
            delay: Duration::from_millis(200),
        };

        let started = Instant::now();
        let mut ctx = test_ctx(ExecMode::Fast);
        let err = Next::new(&chain, &terminal)
            .run(test_request(), &mut ctx)
            .await
            .unwrap_err();

        // The deadline wins well before the continuation would finish.
        assert!(started.elapsed() < Duration::from_millis(150));
        match err {
            GatewayError::UpstreamTimeout { timeout_ms, status } => {
                assert_eq!(timeout_ms, 50);
                assert_eq!(status, 504);
            }
            other => panic!("expected UpstreamTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fast_continuation_passes_through() {
        let chain = chain(Duration::from_millis(200), 504);
        let terminal = ScriptedDispatcher::new(&[201]);

        let mut ctx = test_ctx(ExecMode::Fast);
        let response = Next::new(&chain, &terminal)
            .run(test_request(), &mut ctx)
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }

    /// Dispatcher that exposes the cancellation token it was handed.
    struct TokenCapture {
        seen: Mutex<Option<CancellationToken>>,
        delay: Duration,
    }

    #[async_trait]
    impl Dispatcher for TokenCapture {
        async fn dispatch(
            &self,
            _req: Request<Body>,
            ctx: &mut GatewayContext,
        ) -> Result<Response> {
            *self.seen.lock().unwrap() = ctx.cancellation.clone();
            tokio::time::sleep(self.delay).await;
            Ok(Response::builder().status(200).body(Body::empty()).unwrap())
        }
    }

    #[tokio::test]
    async fn test_token_is_on_context_and_fires_on_expiry() {
        let chain = chain(Duration::from_millis(30), 504);
        let terminal = Arc::new(TokenCapture {
            seen: Mutex::new(None),
            delay: Duration::from_millis(200),
        });

        let mut ctx = test_ctx(ExecMode::Fast);
        let err = Next::new(&chain, terminal.as_ref())
            .run(test_request(), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamTimeout { .. }));

        let token = terminal.seen.lock().unwrap().clone().unwrap();
        assert!(token.is_cancelled());
    }
}
