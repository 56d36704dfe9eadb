use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use metrics::counter;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::{BackoffConfig, RetryPolicyConfig};
use crate::context::GatewayContext;
use crate::error::Result;
use crate::pipeline::{Next, Policy};
use crate::upstream::{dispatch, Transport};

static X_RETRY_COUNT: HeaderName = HeaderName::from_static("x-retry-count");

const DEFAULT_RETRY_STATUSES: [u16; 3] = [502, 503, 504];

/// Replays the upstream snapshot when the response status asks for it.
///
/// Only active for idempotent methods and only when the URL dispatcher
/// recorded a snapshot on the context; otherwise there is nothing safe to
/// replay and the policy passes straight through. Replays go directly to
/// the transport, re-using the original request's cancellation token, so
/// the whole retry loop runs inside the timeout policy's budget.
pub struct RetryPolicy {
    name: String,
    priority: Option<i32>,
    max_retries: u32,
    backoff: BackoffConfig,
    retry_statuses: Vec<u16>,
    methods: Vec<Method>,
    transport: Arc<dyn Transport>,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        let methods = if config.methods.is_empty() {
            vec![
                Method::GET,
                Method::HEAD,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ]
        } else {
            config
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|e| anyhow::anyhow!("invalid retry method '{}': {}", m, e))
                })
                .collect::<anyhow::Result<Vec<_>>>()?
        };

        let retry_statuses = if config.retry_statuses.is_empty() {
            DEFAULT_RETRY_STATUSES.to_vec()
        } else {
            config.retry_statuses
        };

        Ok(Self {
            name: config.name.unwrap_or_else(|| "retry".to_string()),
            priority: config.priority,
            max_retries: config.max_retries,
            backoff: config.backoff,
            retry_statuses,
            methods,
            transport,
        })
    }

    fn is_retryable(&self, status: StatusCode) -> bool {
        self.retry_statuses.contains(&status.as_u16())
    }

    /// Delay before attempt `attempt` (zero-based), jittered.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = match &self.backoff {
            BackoffConfig::Fixed { delay } => *delay,
            BackoffConfig::Exponential { base, max_delay } => base
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(*max_delay),
        };
        let millis = base.as_millis() as u64;
        if millis == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..millis);
        base + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl Policy for RetryPolicy {
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
        if !self.methods.contains(req.method()) {
            return next.run(req, ctx).await;
        }

        let mut response = next.run(req, ctx).await?;

        // Without a snapshot there is no way to re-issue the exact same
        // upstream request, so non-proxy upstreams are left alone.
        let Some(snapshot) = ctx.proxy_snapshot.clone() else {
            return Ok(response);
        };

        let mut attempts = 0u32;
        'retry: while attempts < self.max_retries && self.is_retryable(response.status()) {
            // Dropping the previous response cancels its body stream
            // before the replay goes out.
            drop(response);
            loop {
                let delay = self.backoff_delay(attempts);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempts += 1;
                debug!(
                    attempt = attempts,
                    url = %snapshot.url,
                    "replaying upstream request"
                );
                match self
                    .transport
                    .send(&snapshot, ctx.cancellation.as_ref())
                    .await
                {
                    Ok(upstream) => {
                        response = dispatch::into_response(upstream);
                        continue 'retry;
                    }
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) if attempts >= self.max_retries => return Err(err),
                    Err(err) => {
                        // A transport-level failure mid-retry is itself
                        // retryable until the budget runs out.
                        warn!(
                            attempt = attempts,
                            error = %err,
                            "transport failure during replay, retrying"
                        );
                    }
                }
            }
        }

        ctx.retries_used = attempts;
        if attempts > 0 {
            counter!("gateway_retries_total").increment(attempts as u64);
            response
                .headers_mut()
                .insert(X_RETRY_COUNT.clone(), HeaderValue::from(attempts));
        }
        Ok(response)
    }
}
