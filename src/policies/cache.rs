use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{header, response::Parts, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use http_body_util::BodyExt;
use metrics::counter;
use tracing::warn;

use crate::config::CachePolicyConfig;
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::pipeline::{Next, Policy};
use crate::stores::{CacheStore, CachedResponse};

static X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// GET-only response cache backed by the pluggable cache store.
pub struct CachePolicy {
    name: String,
    priority: Option<i32>,
    ttl: Duration,
    store: Arc<dyn CacheStore>,
}

impl CachePolicy {
    pub fn new(config: CachePolicyConfig, store: Arc<dyn CacheStore>) -> Self {
        Self {
            name: config.name.unwrap_or_else(|| "cache".to_string()),
            priority: config.priority,
            ttl: config.ttl,
            store,
        }
    }

    fn cache_key(&self, ctx: &GatewayContext, req: &Request<Body>) -> String {
        let mut hasher = DefaultHasher::new();
        req.uri().path().hash(&mut hasher);
        req.uri().query().hash(&mut hasher);
        format!("cache:{}:{:x}", ctx.route_path, hasher.finish())
    }

    fn should_cache(&self, parts: &Parts) -> bool {
        if parts.status.as_u16() >= 400 {
            return false;
        }
        if let Some(cache_control) = parts
            .headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
        {
            if cache_control.contains("no-store") || cache_control.contains("no-cache") {
                return false;
            }
        }
        true
    }
}

fn render(cached: CachedResponse, hit: bool) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK));
    if let Some(headers) = response.headers_mut() {
        headers.extend(cached.headers);
    }
    let mut response = response
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    response.headers_mut().insert(
        X_CACHE.clone(),
        HeaderValue::from_static(if hit { "HIT" } else { "MISS" }),
    );
    response
}

#[async_trait]
impl Policy for CachePolicy {
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
        if req.method() != Method::GET {
            return next.run(req, ctx).await;
        }

        let key = self.cache_key(ctx, &req);
        match self.store.get(&key).await {
            Ok(Some(cached)) => {
                counter!("gateway_cache_hits_total").increment(1);
                return Ok(render(cached, true));
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "cache store unavailable, treating as miss"),
        }
        counter!("gateway_cache_misses_total").increment(1);

        let response = next.run(req, ctx).await?;

        // The body must be buffered to be retained; responses flowing
        // through this policy are bytes-backed already.
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to buffer response body: {}", e)))?
            .to_bytes();

        if self.should_cache(&parts) {
            let cached = CachedResponse {
                status: parts.status.as_u16(),
                headers: parts.headers.clone(),
                body: body.clone(),
            };
            if let Err(e) = self.store.put(key, cached, self.ttl).await {
                warn!(error = %e, "failed to store response in cache");
            }
        }

        let mut response = Response::from_parts(parts, Body::from(body));
        response
            .headers_mut()
            .insert(X_CACHE.clone(), HeaderValue::from_static("MISS"));
        Ok(response)
    }
}
