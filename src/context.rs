use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue},
    response::Response,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::GatewaySettings;
use crate::upstream::ProxyRequest;

/// How the policy chain executes for one request.
///
/// `Fast` invokes each policy's continuation directly with no extra
/// bookkeeping. `Instrumented` wraps every policy invocation to record
/// timings, continuation use and errors, and opens a tracing span per
/// policy. The branch between the two lives at the chain cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Fast,
    Instrumented,
}

/// Distributed trace identifiers for one hop.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: u128,
    /// Span id of the caller, when a valid propagation header arrived.
    pub parent_id: Option<u64>,
    /// Span id for this gateway hop.
    pub span_id: u64,
    pub sampled: bool,
}

impl TraceContext {
    /// Parse an inbound `traceparent` value, or start a fresh trace.
    ///
    /// The header is only trusted when it is well-formed: four hyphenated
    /// fields, a known (non-reserved) version, and nonzero trace/parent
    /// ids. Anything else gets a newly generated context instead.
    pub fn parse_or_generate(header: Option<&str>) -> Self {
        match header.and_then(Self::parse) {
            Some(ctx) => ctx,
            None => Self::generate(),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() < 4 {
            return None;
        }
        let (version, trace, parent, flags) = (parts[0], parts[1], parts[2], parts[3]);

        if version.len() != 2 || u8::from_str_radix(version, 16).is_err() {
            return None;
        }
        // 0xff is reserved and must not be propagated.
        if version.eq_ignore_ascii_case("ff") {
            return None;
        }
        // Version 00 defines exactly four fields.
        if version == "00" && parts.len() != 4 {
            return None;
        }

        if trace.len() != 32 {
            return None;
        }
        let trace_id = u128::from_str_radix(trace, 16).ok()?;
        if trace_id == 0 {
            return None;
        }

        if parent.len() != 16 {
            return None;
        }
        let parent_id = u64::from_str_radix(parent, 16).ok()?;
        if parent_id == 0 {
            return None;
        }

        if flags.len() != 2 {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;

        Some(Self {
            trace_id,
            parent_id: Some(parent_id),
            span_id: nonzero_u64(),
            sampled: flags & 0x01 != 0,
        })
    }

    fn generate() -> Self {
        Self {
            trace_id: nonzero_u128(),
            parent_id: None,
            span_id: nonzero_u64(),
            sampled: true,
        }
    }

    /// Render the outbound `traceparent` for this hop.
    pub fn propagation_header(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id,
            self.span_id,
            if self.sampled { 0x01u8 } else { 0x00u8 },
        )
    }
}

fn nonzero_u128() -> u128 {
    loop {
        let id = rand::random::<u128>();
        if id != 0 {
            return id;
        }
    }
}

fn nonzero_u64() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

/// Per-policy instrumentation record, accumulated on the context and
/// rendered once at the end of the request.
#[derive(Debug, Default)]
pub struct PolicyTraceLog {
    entries: Vec<PolicyTraceEntry>,
}

#[derive(Debug, Serialize)]
pub struct PolicyTraceEntry {
    pub policy: String,
    pub duration_us: u64,
    pub continued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl PolicyTraceLog {
    pub fn enter(&mut self, name: &str) -> usize {
        self.entries.push(PolicyTraceEntry {
            policy: name.to_string(),
            duration_us: 0,
            continued: false,
            error: None,
        });
        self.entries.len() - 1
    }

    pub fn mark_continued(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.continued = true;
        }
    }

    pub fn complete(&mut self, index: usize, elapsed: Duration, error: Option<&'static str>) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.duration_us = elapsed.as_micros() as u64;
            entry.error = error;
        }
    }

    pub fn entries(&self) -> &[PolicyTraceEntry] {
        &self.entries
    }

    fn render(&self, total: Duration) -> String {
        serde_json::json!({
            "total_us": total.as_micros() as u64,
            "policies": self.entries,
        })
        .to_string()
    }
}

/// Per-request gateway state.
///
/// Owned exclusively by one request's execution; the only state shared
/// across requests lives in the stores. Cross-policy coupling goes through
/// the typed optional fields below, never through a string-keyed bag.
pub struct GatewayContext {
    pub request_id: String,
    pub trace: TraceContext,
    pub gateway_name: String,
    pub route_path: String,
    pub client_ip: IpAddr,
    pub started_at: Instant,
    pub mode: ExecMode,
    pub debug_facets: Vec<String>,
    pub trace_log: Option<PolicyTraceLog>,
    /// Set by the timeout policy; observed by the upstream transport.
    pub cancellation: Option<CancellationToken>,
    /// Stashed by the URL dispatcher so the retry policy can replay the
    /// exact outbound request.
    pub proxy_snapshot: Option<ProxyRequest>,
    /// A policy may request the inbound Host header be forwarded verbatim.
    pub preserve_host: bool,
    pub retries_used: u32,
}

impl GatewayContext {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Allocates the per-request context and decides the execution mode.
pub struct ContextInjector {
    gateway_name: String,
    request_id_header: HeaderName,
    debug_header: HeaderName,
    trace_policies: bool,
}

static TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");
static GATEWAY_TRACE: HeaderName = HeaderName::from_static("x-gateway-trace");

impl ContextInjector {
    pub fn new(settings: &GatewaySettings) -> Result<Self> {
        Ok(Self {
            gateway_name: settings.name.clone(),
            request_id_header: HeaderName::from_bytes(settings.request_id_header.as_bytes())?,
            debug_header: HeaderName::from_bytes(settings.debug_header.as_bytes())?,
            trace_policies: settings.trace_policies,
        })
    }

    pub fn inject(
        &self,
        req: &Request<Body>,
        client_ip: IpAddr,
        route_path: &str,
    ) -> GatewayContext {
        let request_id = Uuid::new_v4().to_string();
        let trace = TraceContext::parse_or_generate(
            req.headers().get(&TRACEPARENT).and_then(|v| v.to_str().ok()),
        );

        let debug_facets = req
            .headers()
            .get(&self.debug_header)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(|f| f.trim().to_ascii_lowercase())
                    .filter(|f| !f.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let instrumented = self.trace_policies || !debug_facets.is_empty();
        let mode = if instrumented {
            ExecMode::Instrumented
        } else {
            ExecMode::Fast
        };

        if instrumented {
            debug!(request_id = %request_id, facets = ?debug_facets, "instrumented execution");
        }

        GatewayContext {
            request_id,
            trace,
            gateway_name: self.gateway_name.clone(),
            route_path: route_path.to_string(),
            client_ip,
            started_at: Instant::now(),
            mode,
            debug_facets,
            trace_log: instrumented.then(PolicyTraceLog::default),
            cancellation: None,
            proxy_snapshot: None,
            preserve_host: false,
            retries_used: 0,
        }
    }

    /// Stamp correlation and trace-propagation headers on the final
    /// response, plus the debug payload when the client asked for it.
    pub fn finalize(&self, ctx: &GatewayContext, response: &mut Response) {
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response
                .headers_mut()
                .insert(self.request_id_header.clone(), value);
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.trace.propagation_header()) {
            response.headers_mut().insert(TRACEPARENT.clone(), value);
        }
        if !ctx.debug_facets.is_empty() {
            if let Some(log) = &ctx.trace_log {
                if let Ok(value) = HeaderValue::from_str(&log.render(ctx.elapsed())) {
                    response.headers_mut().insert(GATEWAY_TRACE.clone(), value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::net::Ipv4Addr;

    fn injector() -> ContextInjector {
        ContextInjector::new(&GatewaySettings::default()).unwrap()
    }

    fn request(headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/api/users");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_valid_traceparent_is_adopted() {
        let ctx = TraceContext::parse_or_generate(Some(
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        ));
        assert_eq!(ctx.trace_id, 0x0af7651916cd43dd8448eb211c80319c);
        assert_eq!(ctx.parent_id, Some(0xb7ad6b7169203331));
        assert!(ctx.sampled);
        assert_ne!(ctx.span_id, 0);
    }

    #[test]
    fn test_unsampled_flag_is_preserved() {
        let ctx = TraceContext::parse_or_generate(Some(
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00",
        ));
        assert_eq!(ctx.parent_id, Some(0xb7ad6b7169203331));
        assert!(!ctx.sampled);
    }

    #[test]
    fn test_bad_traceparent_generates_fresh_context() {
        let cases = [
            // malformed shape
            "not-a-traceparent",
            "00-abc-def-01",
            // reserved version
            "ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            // all-zero trace id
            "00-00000000000000000000000000000000-b7ad6b7169203331-01",
            // all-zero parent id
            "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01",
            // version 00 with trailing fields
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
        ];
        for case in cases {
            let ctx = TraceContext::parse_or_generate(Some(case));
            assert_eq!(ctx.parent_id, None, "should regenerate for {case:?}");
            assert_ne!(ctx.trace_id, 0);
            assert_ne!(ctx.span_id, 0);
        }

        let ctx = TraceContext::parse_or_generate(None);
        assert_eq!(ctx.parent_id, None);
        assert_ne!(ctx.trace_id, 0);
    }

    #[test]
    fn test_propagation_header_shape() {
        let ctx = TraceContext::generate();
        let header = ctx.propagation_header();
        let parts: Vec<&str> = header.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "00");
        assert_eq!(parts[1].len(), 32);
        assert_eq!(parts[2].len(), 16);
        assert_eq!(parts[3], "01");
    }

    #[test]
    fn test_fast_path_by_default() {
        let ctx = injector().inject(
            &request(&[]),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "/api/users",
        );
        assert_eq!(ctx.mode, ExecMode::Fast);
        assert!(ctx.trace_log.is_none());
    }

    #[test]
    fn test_debug_header_selects_instrumented_path() {
        let ctx = injector().inject(
            &request(&[("x-gateway-debug", "policies, timing")]),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "/api/users",
        );
        assert_eq!(ctx.mode, ExecMode::Instrumented);
        assert_eq!(ctx.debug_facets, vec!["policies", "timing"]);
        assert!(ctx.trace_log.is_some());
    }

    #[test]
    fn test_finalize_sets_correlation_headers() {
        let injector = injector();
        let ctx = injector.inject(
            &request(&[]),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "/api/users",
        );
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap();
        injector.finalize(&ctx, &mut response);

        assert_eq!(
            response.headers().get("x-request-id").unwrap().to_str().unwrap(),
            ctx.request_id
        );
        let traceparent = response
            .headers()
            .get("traceparent")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(traceparent.starts_with("00-"));
        assert!(traceparent.contains(&format!("{:032x}", ctx.trace.trace_id)));
        assert!(response.headers().get("x-gateway-trace").is_none());
    }
}
