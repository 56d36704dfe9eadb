use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::HttpClientConfig;
use crate::error::{GatewayError, Result};

use super::{ProxyRequest, UpstreamResponse};

/// Performs the actual outbound HTTP call.
///
/// The cancellation token is advisory: when it fires mid-call, the
/// transport aborts and returns `Cancelled` verbatim so the timeout
/// policy can recognize it. Network-layer failures are wrapped into a
/// gateway-class upstream error instead.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        req: &ProxyRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<UpstreamResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        req: &ProxyRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<UpstreamResponse> {
        let fetch = async {
            let response = self
                .client
                .request(req.method.clone(), req.url.clone())
                .headers(req.headers.clone())
                .body(req.body.clone())
                .send()
                .await
                .map_err(|e| {
                    error!(url = %req.url, error = %e, "upstream request failed");
                    GatewayError::Upstream(format!("request failed: {}", e))
                })?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| GatewayError::Upstream(format!("failed to read response body: {}", e)))?;

            Ok(UpstreamResponse {
                status,
                headers,
                body,
            })
        };

        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(GatewayError::Cancelled),
                result = fetch => result,
            },
            None => fetch.await,
        }
    }
}
