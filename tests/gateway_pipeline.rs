//! End-to-end pipeline tests: a gateway built from YAML configuration,
//! dispatching to a scripted in-process transport instead of the network.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;

use edge_gateway::error::{GatewayError, Result as GatewayResult};
use edge_gateway::upstream::{ProxyRequest, Transport, UpstreamResponse};
use edge_gateway::{Config, Gateway};

enum Step {
    Status(u16),
    /// Respond with the status only after the delay, honoring cancellation.
    Slow(Duration, u16),
    Fail,
}

/// Transport double that answers a scripted sequence of outcomes (the
/// last step repeats) and records every outbound request it sees.
struct MockUpstream {
    script: Vec<Step>,
    calls: AtomicUsize,
    seen: Mutex<Vec<ProxyRequest>>,
}

impl MockUpstream {
    fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen_urls(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|req| req.url.to_string())
            .collect()
    }
}

#[async_trait]
impl Transport for MockUpstream {
    async fn send(
        &self,
        req: &ProxyRequest,
        cancel: Option<&CancellationToken>,
    ) -> GatewayResult<UpstreamResponse> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(req.clone());

        let step = self
            .script
            .get(index)
            .or_else(|| self.script.last())
            .expect("mock transport needs a script");

        let status = match step {
            Step::Status(status) => *status,
            Step::Fail => return Err(GatewayError::Upstream("connection refused".into())),
            Step::Slow(delay, status) => {
                match cancel {
                    Some(token) => tokio::select! {
                        _ = token.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep(*delay) => {}
                    },
                    None => tokio::time::sleep(*delay).await,
                }
                *status
            }
        };

        Ok(UpstreamResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"upstream body"),
        })
    }
}

fn gateway(yaml: &str, transport: Arc<MockUpstream>) -> Gateway {
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();
    Gateway::with_transport(&config, transport).unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

fn client() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn error_code(response: Response) -> String {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    value["error"]["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_request_flows_through_the_full_chain() {
    let transport = MockUpstream::new(vec![Step::Status(200)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
policies:
  - type: timeout
    priority: 10
    timeout: 5s
  - type: rate_limit
    max: 100
    window: 60s
routes:
  - path: /api/users
    upstream:
      url: http://10.0.0.5:3000
"#,
        transport.clone(),
    );

    let response = gateway
        .route("/api/users")
        .unwrap()
        .handle(get("/api/users"), client())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-request-id").is_some());
    assert!(header(&response, "traceparent").unwrap().starts_with("00-"));
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("100"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("99"));

    assert_eq!(transport.calls(), 1);
    let seen = transport.seen.lock().unwrap();
    assert_eq!(seen[0].url.as_str(), "http://10.0.0.5:3000/api/users");
    assert_eq!(
        seen[0].headers.get("x-forwarded-for").unwrap(),
        "203.0.113.7"
    );
}

#[tokio::test]
async fn test_circuit_opens_after_threshold_and_rejects_without_dispatch() {
    let transport = MockUpstream::new(vec![Step::Status(500)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
routes:
  - path: /api/flaky
    policies:
      - type: circuit_breaker
        failure_threshold: 3
        reset_timeout: 30s
    upstream:
      url: http://10.0.0.5:3000
"#,
        transport.clone(),
    );
    let pipeline = gateway.route("/api/flaky").unwrap();

    for _ in 0..3 {
        let response = pipeline.handle(get("/api/flaky"), client()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(transport.calls(), 3);

    // Inside the reset window the continuation is never invoked.
    let rejected = pipeline.handle(get("/api/flaky"), client()).await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(header(&rejected, "retry-after").is_some());
    assert_eq!(error_code(rejected).await, "CIRCUIT_OPEN");
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_rate_limiter_rejects_over_limit_then_resets() {
    let transport = MockUpstream::new(vec![Step::Status(200)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
routes:
  - path: /api/users
    policies:
      - type: rate_limit
        max: 5
        window: 300ms
    upstream:
      url: http://10.0.0.5:3000
"#,
        transport.clone(),
    );
    let pipeline = gateway.route("/api/users").unwrap();

    for _ in 0..5 {
        let response = pipeline.handle(get("/api/users"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let rejected = pipeline.handle(get("/api/users"), client()).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&rejected, "x-ratelimit-remaining"), Some("0"));
    assert!(header(&rejected, "retry-after").is_some());
    assert_eq!(error_code(rejected).await, "RATE_LIMITED");
    assert_eq!(transport.calls(), 5);

    // A fresh window starts counting from one again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let response = pipeline.handle(get("/api/users"), client()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("4"));
}

#[tokio::test]
async fn test_retry_replays_snapshot_until_success() {
    let transport = MockUpstream::new(vec![
        Step::Status(503),
        Step::Status(503),
        Step::Status(200),
    ]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
routes:
  - path: /api/users
    policies:
      - type: retry
        max_retries: 2
        backoff:
          strategy: fixed
          delay: 1ms
    upstream:
      url: http://10.0.0.5:3000
"#,
        transport.clone(),
    );

    let response = gateway
        .route("/api/users")
        .unwrap()
        .handle(get("/api/users"), client())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-retry-count"), Some("2"));
    assert_eq!(transport.calls(), 3);

    // Every replay targeted the identical snapshot URL.
    let urls = transport.seen_urls();
    assert!(urls.iter().all(|url| url == &urls[0]));
}

#[tokio::test]
async fn test_transport_failure_during_replay_is_retried() {
    let transport = MockUpstream::new(vec![Step::Status(503), Step::Fail, Step::Status(200)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
routes:
  - path: /api/users
    policies:
      - type: retry
        max_retries: 2
        backoff:
          strategy: fixed
          delay: 1ms
    upstream:
      url: http://10.0.0.5:3000
"#,
        transport.clone(),
    );

    let response = gateway
        .route("/api/users")
        .unwrap()
        .handle(get("/api/users"), client())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-retry-count"), Some("2"));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_timeout_wins_over_slow_upstream() {
    let transport = MockUpstream::new(vec![Step::Slow(Duration::from_millis(200), 200)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
routes:
  - path: /api/slow
    policies:
      - type: timeout
        timeout: 50ms
    upstream:
      url: http://10.0.0.5:3000
"#,
        transport.clone(),
    );

    let started = Instant::now();
    let response = gateway
        .route("/api/slow")
        .unwrap()
        .handle(get("/api/slow"), client())
        .await;

    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_code(response).await, "UPSTREAM_TIMEOUT");
}

#[tokio::test]
async fn test_foreign_origin_rewrite_is_rejected_before_dispatch() {
    let transport = MockUpstream::new(vec![Step::Status(200)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
routes:
  - path: /api/users
    upstream:
      url: https://api.example.com
      rewrite:
        pattern: "^.*$"
        replacement: "//evil.com/x"
"#,
        transport.clone(),
    );

    let response = gateway
        .route("/api/users")
        .unwrap()
        .handle(get("/api/users"), client())
        .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(response).await, "UPSTREAM_CONFIG_ERROR");
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_route_policy_overrides_global_and_debug_reports_order() {
    // The route-tier timeout replaces the 5s global one; the slow
    // upstream proves the 50ms override is the one that runs.
    let transport = MockUpstream::new(vec![Step::Slow(Duration::from_millis(200), 200)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
policies:
  - type: timeout
    priority: 10
    timeout: 5s
  - type: rate_limit
    max: 100
    window: 60s
routes:
  - path: /api/slow
    policies:
      - type: timeout
        priority: 10
        timeout: 50ms
    upstream:
      url: http://10.0.0.5:3000
"#,
        transport.clone(),
    );

    let req = Request::builder()
        .method("GET")
        .uri("/api/slow")
        .header("x-gateway-debug", "policies")
        .body(Body::empty())
        .unwrap();
    let response = gateway.route("/api/slow").unwrap().handle(req, client()).await;

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    let trace: serde_json::Value =
        serde_json::from_str(header(&response, "x-gateway-trace").unwrap()).unwrap();
    let names: Vec<&str> = trace["policies"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["policy"].as_str().unwrap())
        .collect();

    // One timeout entry only (the override), ahead of the default-priority
    // rate limiter.
    assert_eq!(names, vec!["timeout", "rate_limit"]);
}

#[tokio::test]
async fn test_service_upstream_rotates_servers() {
    let transport = MockUpstream::new(vec![Step::Status(200)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
upstreams:
  backend:
    servers:
      - url: http://10.0.0.1:3000
      - url: http://10.0.0.2:3000
routes:
  - path: /api/users
    upstream:
      service: backend
"#,
        transport.clone(),
    );
    let pipeline = gateway.route("/api/users").unwrap();

    for _ in 0..2 {
        let response = pipeline.handle(get("/api/users"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let urls = transport.seen_urls();
    assert_eq!(urls.len(), 2);
    assert_ne!(urls[0], urls[1]);
}

#[tokio::test]
async fn test_retry_of_non_retryable_status_performs_one_call() {
    let transport = MockUpstream::new(vec![Step::Status(404)]);
    let gateway = gateway(
        r#"
server:
  host: 127.0.0.1
  port: 8080
routes:
  - path: /api/users
    policies:
      - type: retry
        max_retries: 3
        backoff:
          strategy: fixed
          delay: 1ms
    upstream:
      url: http://10.0.0.5:3000
"#,
        transport.clone(),
    );

    let response = gateway
        .route("/api/users")
        .unwrap()
        .handle(get("/api/users"), client())
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(header(&response, "x-retry-count").is_none());
    assert_eq!(transport.calls(), 1);
}
