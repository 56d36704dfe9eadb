pub mod dispatch;
pub mod transport;

pub use dispatch::{Dispatcher, InlineHandler, RewriteRule, UpstreamDispatcher, UpstreamTarget};
pub use transport::{ReqwestTransport, Transport};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use reqwest::Url;
use tracing::{info, warn};

use crate::config::UpstreamSetConfig;

/// Immutable clone of the outbound upstream request.
///
/// Stashed on the gateway context by the URL dispatcher so the retry
/// policy can re-issue the exact same request without re-running upstream
/// selection. The body is `Bytes`, so cloning is cheap.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the transport hands back from one outbound call.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct FailState {
    current_fails: u32,
    last_fail_at: Option<Instant>,
}

/// One server inside an upstream set, with failure accounting.
pub struct UpstreamServer {
    base: Url,
    max_fails: u32,
    fail_timeout: Duration,
    state: Mutex<FailState>,
}

impl UpstreamServer {
    /// Check if the server is available (not in fail state)
    fn is_available(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.current_fails < self.max_fails {
            return true;
        }
        if let Some(last_fail) = state.last_fail_at {
            if last_fail.elapsed() > self.fail_timeout {
                return true;
            }
        }
        false
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.current_fails += 1;
        state.last_fail_at = Some(Instant::now());
        warn!(
            server = %self.base,
            fails = state.current_fails,
            max_fails = self.max_fails,
            "upstream server failed"
        );
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.current_fails > 0 {
            info!(server = %self.base, "upstream server recovered, resetting fail count");
            state.current_fails = 0;
            state.last_fail_at = None;
        }
    }
}

/// Named set of upstream servers with round-robin selection.
pub struct UpstreamSet {
    name: String,
    servers: Vec<UpstreamServer>,
    cursor: AtomicUsize,
}

impl UpstreamSet {
    pub fn from_config(name: &str, config: &UpstreamSetConfig) -> Result<Self> {
        let servers = config
            .servers
            .iter()
            .map(|server| {
                let base = Url::parse(&server.url).with_context(|| {
                    format!("invalid server url '{}' in upstream set '{}'", server.url, name)
                })?;
                Ok(UpstreamServer {
                    base,
                    max_fails: server.max_fails,
                    fail_timeout: server.fail_timeout,
                    state: Mutex::new(FailState {
                        current_fails: 0,
                        last_fail_at: None,
                    }),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(set = %name, servers = servers.len(), "configured upstream set");
        Ok(Self {
            name: name.to_string(),
            servers,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next available base URL in round-robin order, skipping servers in
    /// their fail window.
    pub fn next_base(&self) -> Option<Url> {
        let len = self.servers.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let server = &self.servers[(start + offset) % len];
            if server.is_available() {
                return Some(server.base.clone());
            }
        }
        warn!(set = %self.name, "no available servers in upstream set");
        None
    }

    pub fn record_result(&self, base: &Url, success: bool) {
        if let Some(server) = self.servers.iter().find(|s| &s.base == base) {
            if success {
                server.record_success();
            } else {
                server.record_failure();
            }
        }
    }
}
