use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use regex::Regex;
use reqwest::Url;
use tracing::{debug, error};

use crate::config::RewriteRuleConfig;
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};

use super::{ProxyRequest, Transport, UpstreamResponse, UpstreamSet};

/// Terminal handler at the end of a policy chain.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, req: Request<Body>, ctx: &mut GatewayContext) -> Result<Response>;
}

/// Hand-written terminal for routes that never leave the process.
#[async_trait]
pub trait InlineHandler: Send + Sync {
    async fn call(&self, req: Request<Body>, ctx: &mut GatewayContext) -> Result<Response>;
}

/// A route's upstream declaration, resolved at gateway build time.
pub enum UpstreamTarget {
    /// Proxy to a fixed base URL.
    Url { base: Url },
    /// Proxy to a named server set, one base chosen per request.
    Service { set: Arc<UpstreamSet> },
    /// Run an in-process handler.
    Handler(Arc<dyn InlineHandler>),
}

/// Path rewrite applied before the outbound URL is resolved.
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    pub fn from_config(config: &RewriteRuleConfig) -> anyhow::Result<Self> {
        Ok(Self {
            pattern: Regex::new(&config.pattern)?,
            replacement: config.replacement.clone(),
        })
    }

    pub fn apply(&self, path: &str) -> String {
        self.pattern
            .replace(path, self.replacement.as_str())
            .into_owned()
    }
}

/// Turns a route's upstream declaration into the terminal handler.
pub struct UpstreamDispatcher {
    target: UpstreamTarget,
    rewrite: Option<RewriteRule>,
    transport: Arc<dyn Transport>,
}

impl UpstreamDispatcher {
    pub fn new(
        target: UpstreamTarget,
        rewrite: Option<RewriteRule>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            target,
            rewrite,
            transport,
        }
    }

    async fn proxy(
        &self,
        base: Url,
        req: Request<Body>,
        ctx: &mut GatewayContext,
    ) -> Result<Response> {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| GatewayError::BadRequest(format!("failed to read request body: {}", e)))?
            .to_bytes();

        let target = resolve_target(&base, self.rewrite.as_ref(), &parts.uri)?;
        debug!(request_id = %ctx.request_id, target = %target, "forwarding request");

        let mut headers = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop_header(name) || name == header::HOST || name == header::CONTENT_LENGTH
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        // Host follows the target unless a policy asked to preserve it.
        if ctx.preserve_host {
            if let Some(host) = parts.headers.get(header::HOST) {
                headers.insert(header::HOST, host.clone());
            }
        }

        let forwarded_for = match parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) => format!("{}, {}", prior, ctx.client_ip),
            None => ctx.client_ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            headers.insert(HeaderName::from_static("x-request-id"), value);
        }

        let snapshot = ProxyRequest {
            method: parts.method.clone(),
            url: target,
            headers,
            body,
        };
        ctx.proxy_snapshot = Some(snapshot.clone());

        let upstream = self
            .transport
            .send(&snapshot, ctx.cancellation.as_ref())
            .await?;
        Ok(into_response(upstream))
    }
}

#[async_trait]
impl Dispatcher for UpstreamDispatcher {
    async fn dispatch(&self, req: Request<Body>, ctx: &mut GatewayContext) -> Result<Response> {
        match &self.target {
            UpstreamTarget::Handler(handler) => handler.call(req, ctx).await,
            UpstreamTarget::Url { base } => self.proxy(base.clone(), req, ctx).await,
            UpstreamTarget::Service { set } => {
                let base = set
                    .next_base()
                    .ok_or_else(|| GatewayError::ServiceUnavailable(set.name().to_string()))?;
                let result = self.proxy(base.clone(), req, ctx).await;
                match &result {
                    Err(GatewayError::Upstream(_)) => set.record_result(&base, false),
                    Err(GatewayError::Cancelled) => {}
                    _ => set.record_result(&base, true),
                }
                result
            }
        }
    }
}

/// Recompute the outbound URL and enforce that it stays on the
/// configured origin.
///
/// The origin comparison happens after the rewrite is resolved against
/// the base, so absolute and protocol-relative rewrite output cannot
/// redirect the proxy to a foreign host.
fn resolve_target(base: &Url, rewrite: Option<&RewriteRule>, uri: &Uri) -> Result<Url> {
    let path = uri.path();
    let outbound = match rewrite {
        Some(rule) => rule.apply(path),
        None => path.to_string(),
    };

    let mut target = base.join(&outbound).map_err(|e| {
        GatewayError::UpstreamConfig(format!(
            "cannot resolve path '{}' against upstream base: {}",
            outbound, e
        ))
    })?;

    if !same_origin(&target, base) {
        return Err(GatewayError::UpstreamConfig(format!(
            "rewritten path '{}' resolves outside the configured upstream origin",
            outbound
        )));
    }

    target.set_query(uri.query());
    Ok(target)
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Helper function to identify hop-by-hop headers
pub(crate) fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Build the client-facing response from an upstream response, stripping
/// hop-by-hop headers.
pub fn into_response(upstream: UpstreamResponse) -> Response {
    let mut builder = Response::builder().status(upstream.status);
    for (name, value) in upstream.headers.iter() {
        if is_hop_by_hop_header(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error!("Failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}
