use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::Method,
    response::{IntoResponse, Response},
    routing::{any, on, MethodFilter},
    Router,
};
use reqwest::Url;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::context::ContextInjector;
use crate::observability;
use crate::pipeline::{MergedPolicyChain, Next};
use crate::policies::{build_policy, PolicyDeps};
use crate::stores::{MemoryCacheStore, MemoryCircuitBreakerStore, MemoryRateLimitStore};
use crate::upstream::{
    ReqwestTransport, RewriteRule, Transport, UpstreamDispatcher, UpstreamSet, UpstreamTarget,
};

/// One route's executable pipeline: merged policy chain plus terminal
/// dispatcher, built once at gateway construction and immutable afterwards.
pub struct RoutePipeline {
    path: String,
    method_filter: Option<MethodFilter>,
    chain: MergedPolicyChain,
    dispatcher: UpstreamDispatcher,
    injector: Arc<ContextInjector>,
}

impl RoutePipeline {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn chain(&self) -> &MergedPolicyChain {
        &self.chain
    }

    /// Run one request through the chain and the terminal dispatcher.
    ///
    /// This is the top-level error boundary: policy rejections are
    /// rendered into their structured envelope here, and every response
    /// (success or rejection) gets the correlation and trace headers
    /// before it leaves.
    pub async fn handle(&self, req: Request<Body>, client_ip: IpAddr) -> Response {
        let method = req.method().clone();
        let mut ctx = self.injector.inject(&req, client_ip, &self.path);

        let outcome = Next::new(self.chain.policies(), &self.dispatcher)
            .run(req, &mut ctx)
            .await;

        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => {
                observability::record_rejection(err.error_code());
                warn!(
                    request_id = %ctx.request_id,
                    route = %self.path,
                    code = err.error_code(),
                    error = %err,
                    "request rejected"
                );
                err.into_response()
            }
        };

        self.injector.finalize(&ctx, &mut response);

        let status = response.status().as_u16();
        observability::record_request(method.as_str(), &self.path, status, ctx.elapsed());
        info!(
            request_id = %ctx.request_id,
            gateway = %ctx.gateway_name,
            method = %method,
            route = %self.path,
            status,
            retries = ctx.retries_used,
            duration_ms = ctx.elapsed().as_millis() as u64,
            client_ip = %client_ip,
            "request completed"
        );
        response
    }
}

/// Top-level composition: context injector, merged policy chains and
/// upstream dispatchers wired together per route.
pub struct Gateway {
    host: String,
    port: u16,
    routes: Vec<Arc<RoutePipeline>>,
}

impl Gateway {
    /// Build the gateway with the production HTTP transport.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config.client)?);
        Self::with_transport(config, transport)
    }

    /// Build with a caller-supplied transport; tests substitute a mock
    /// here. Must run inside the Tokio runtime, since the store sweep
    /// tasks are spawned during construction.
    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let rate_store = Arc::new(MemoryRateLimitStore::new(config.stores.rate_limit_max_keys));
        rate_store.start_sweeper(config.stores.sweep_interval);
        let cache_store = Arc::new(MemoryCacheStore::new(config.stores.cache_max_entries));
        cache_store.start_sweeper(config.stores.sweep_interval);

        let deps = PolicyDeps {
            transport: transport.clone(),
            breaker_store: Arc::new(MemoryCircuitBreakerStore::new()),
            rate_store,
            cache_store,
        };

        let injector = Arc::new(ContextInjector::new(&config.gateway)?);

        let global = config
            .policies
            .iter()
            .map(|spec| build_policy(spec, &deps))
            .collect::<Result<Vec<_>>>()?;

        let mut sets: HashMap<String, Arc<UpstreamSet>> = HashMap::new();
        for (name, set_config) in &config.upstreams {
            sets.insert(
                name.clone(),
                Arc::new(UpstreamSet::from_config(name, set_config)?),
            );
        }

        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            let tier = route
                .policies
                .iter()
                .map(|spec| build_policy(spec, &deps))
                .collect::<Result<Vec<_>>>()?;
            let chain = MergedPolicyChain::merge(
                &global,
                &tier,
                config.gateway.default_policy_priority,
            );

            let target = match (&route.upstream.url, &route.upstream.service) {
                (Some(url), None) => UpstreamTarget::Url {
                    base: Url::parse(url).with_context(|| {
                        format!("invalid upstream url for route '{}'", route.path)
                    })?,
                },
                (None, Some(service)) => UpstreamTarget::Service {
                    set: sets.get(service).cloned().with_context(|| {
                        format!(
                            "route '{}' references unknown upstream set '{}'",
                            route.path, service
                        )
                    })?,
                },
                _ => anyhow::bail!(
                    "route '{}' must declare exactly one of url or service",
                    route.path
                ),
            };
            let rewrite = route
                .upstream
                .rewrite
                .as_ref()
                .map(RewriteRule::from_config)
                .transpose()?;
            let dispatcher = UpstreamDispatcher::new(target, rewrite, transport.clone());

            info!(
                route = %route.path,
                policies = chain.len(),
                "registered route pipeline"
            );
            routes.push(Arc::new(RoutePipeline {
                path: route.path.clone(),
                method_filter: method_filter(&route.methods)?,
                chain,
                dispatcher,
                injector: injector.clone(),
            }));
        }

        Ok(Self {
            host: config.server.host.clone(),
            port: config.server.port,
            routes,
        })
    }

    pub fn route(&self, path: &str) -> Option<&Arc<RoutePipeline>> {
        self.routes.iter().find(|route| route.path == path)
    }

    /// Assemble the axum router. Path matching itself is axum's concern;
    /// each matched route hands the request to its pipeline.
    pub fn router(&self) -> Router {
        let mut router = Router::new();
        for pipeline in &self.routes {
            let handler = {
                let pipeline = pipeline.clone();
                move |ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request<Body>| {
                    let pipeline = pipeline.clone();
                    async move { pipeline.handle(req, addr.ip()).await }
                }
            };
            router = match pipeline.method_filter {
                Some(filter) => router.route(&pipeline.path, on(filter, handler)),
                None => router.route(&pipeline.path, any(handler)),
            };
        }
        router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .into_inner(),
        )
    }

    /// Bind and serve until the task is cancelled or the listener fails.
    pub async fn serve(&self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind to {}", addr))?;

        info!("gateway listening on {}", addr);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("server error")?;

        Ok(())
    }
}

fn method_filter(methods: &[String]) -> Result<Option<MethodFilter>> {
    let mut filter: Option<MethodFilter> = None;
    for name in methods {
        let method = Method::from_bytes(name.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid route method '{}'", name))?;
        let single = MethodFilter::try_from(method)
            .map_err(|e| anyhow::anyhow!("unsupported route method '{}': {}", name, e))?;
        filter = Some(match filter {
            Some(existing) => existing.or(single),
            None => single,
        });
    }
    Ok(filter)
}
