use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub client: HttpClientConfig,
    #[serde(default)]
    pub stores: StoreConfig,
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamSetConfig>,
    pub routes: Vec<RouteConfig>,
    /// Global policy tier, merged into every route's chain.
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_name")]
    pub name: String,
    /// Priority assigned to policies that do not declare one.
    #[serde(default = "default_policy_priority")]
    pub default_policy_priority: i32,
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
    /// Request header a client sets to receive per-policy debug output.
    #[serde(default = "default_debug_header")]
    pub debug_header: String,
    /// Force the instrumented execution path for every request.
    #[serde(default)]
    pub trace_policies: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            default_policy_priority: default_policy_priority(),
            request_id_header: default_request_id_header(),
            debug_header: default_debug_header(),
            trace_policies: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpClientConfig {
    #[serde(with = "duration_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_pool_idle_timeout")]
    pub pool_idle_timeout: Duration,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            pool_idle_timeout: default_pool_idle_timeout(),
            pool_max_idle_per_host: default_pool_max_idle(),
            user_agent: default_user_agent(),
        }
    }
}

/// Bounds for the in-memory stores shared across requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Key-cardinality ceiling for the rate limit store; new keys beyond
    /// it are rejected rather than admitted (fail closed).
    #[serde(default = "default_rate_limit_max_keys")]
    pub rate_limit_max_keys: usize,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(with = "duration_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rate_limit_max_keys: default_rate_limit_max_keys(),
            cache_max_entries: default_cache_max_entries(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamSetConfig {
    pub servers: Vec<UpstreamServerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamServerConfig {
    pub url: String,
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    #[serde(with = "duration_serde", default = "default_fail_timeout")]
    pub fail_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub path: String,
    /// HTTP methods served by this route; empty means any.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Route policy tier; a name collision with a global policy replaces it.
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
    pub upstream: UpstreamRef,
}

/// A route's upstream declaration: an inline URL or a named upstream set.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpstreamRef {
    pub url: Option<String>,
    pub service: Option<String>,
    pub rewrite: Option<RewriteRuleConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RewriteRuleConfig {
    pub pattern: String,
    pub replacement: String,
}

/// One policy declaration inside a global or route tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicySpec {
    RateLimit(RateLimitPolicyConfig),
    CircuitBreaker(CircuitBreakerPolicyConfig),
    Retry(RetryPolicyConfig),
    Timeout(TimeoutPolicyConfig),
    Cache(CachePolicyConfig),
}

impl PolicySpec {
    /// Name used for cross-tier deduplication; defaults to the policy type.
    pub fn name(&self) -> &str {
        let declared = match self {
            PolicySpec::RateLimit(c) => c.name.as_deref(),
            PolicySpec::CircuitBreaker(c) => c.name.as_deref(),
            PolicySpec::Retry(c) => c.name.as_deref(),
            PolicySpec::Timeout(c) => c.name.as_deref(),
            PolicySpec::Cache(c) => c.name.as_deref(),
        };
        declared.unwrap_or(match self {
            PolicySpec::RateLimit(_) => "rate_limit",
            PolicySpec::CircuitBreaker(_) => "circuit_breaker",
            PolicySpec::Retry(_) => "retry",
            PolicySpec::Timeout(_) => "timeout",
            PolicySpec::Cache(_) => "cache",
        })
    }

    pub fn priority(&self) -> Option<i32> {
        match self {
            PolicySpec::RateLimit(c) => c.priority,
            PolicySpec::CircuitBreaker(c) => c.priority,
            PolicySpec::Retry(c) => c.priority,
            PolicySpec::Timeout(c) => c.priority,
            PolicySpec::Cache(c) => c.priority,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitPolicyConfig {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub max: u64,
    #[serde(with = "duration_serde")]
    pub window: Duration,
    #[serde(default)]
    pub key: RateLimitKeySource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKeySource {
    #[default]
    ClientIp,
    Route,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerPolicyConfig {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub failure_threshold: u32,
    #[serde(with = "duration_serde")]
    pub reset_timeout: Duration,
    #[serde(default = "default_half_open_max")]
    pub half_open_max: u32,
    /// Response statuses counted as failures; empty means any 5xx.
    #[serde(default)]
    pub failure_statuses: Vec<u16>,
    #[serde(default)]
    pub key: BreakerKeySource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKeySource {
    #[default]
    Route,
    ClientIp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicyConfig {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Statuses that trigger a replay; empty means 502/503/504.
    #[serde(default)]
    pub retry_statuses: Vec<u16>,
    /// Methods the policy is active for; empty means the idempotent set.
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed {
        #[serde(with = "duration_serde")]
        delay: Duration,
    },
    Exponential {
        #[serde(with = "duration_serde")]
        base: Duration,
        #[serde(with = "duration_serde")]
        max_delay: Duration,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Fixed {
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutPolicyConfig {
    pub name: Option<String>,
    pub priority: Option<i32>,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_timeout_status")]
    pub status: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CachePolicyConfig {
    pub name: Option<String>,
    pub priority: Option<i32>,
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        for (name, upstream) in &self.upstreams {
            if upstream.servers.is_empty() {
                anyhow::bail!("Upstream set '{}' must have at least one server", name);
            }
            for server in &upstream.servers {
                if server.url.is_empty() {
                    anyhow::bail!("Server URL cannot be empty in upstream set '{}'", name);
                }
            }
        }

        for route in &self.routes {
            if route.path.is_empty() {
                anyhow::bail!("Route path cannot be empty");
            }
            match (&route.upstream.url, &route.upstream.service) {
                (None, None) => {
                    anyhow::bail!("Route '{}' declares neither url nor service", route.path)
                }
                (Some(_), Some(_)) => {
                    anyhow::bail!("Route '{}' declares both url and service", route.path)
                }
                (None, Some(service)) => {
                    if !self.upstreams.contains_key(service) {
                        anyhow::bail!(
                            "Route '{}' references unknown upstream set: {}",
                            route.path,
                            service
                        );
                    }
                }
                (Some(_), None) => {}
            }
            if let Some(rewrite) = &route.upstream.rewrite {
                regex::Regex::new(&rewrite.pattern).with_context(|| {
                    format!("Route '{}' has an invalid rewrite pattern", route.path)
                })?;
            }
            for spec in route.policies.iter().chain(self.policies.iter()) {
                validate_policy(spec, &route.path)?;
            }
        }

        Ok(())
    }
}

fn validate_policy(spec: &PolicySpec, route: &str) -> Result<()> {
    match spec {
        PolicySpec::RateLimit(c) => {
            if c.max == 0 {
                anyhow::bail!("rate_limit max cannot be zero (route '{}')", route);
            }
            if c.window.is_zero() {
                anyhow::bail!("rate_limit window cannot be zero (route '{}')", route);
            }
        }
        PolicySpec::CircuitBreaker(c) => {
            if c.failure_threshold == 0 {
                anyhow::bail!(
                    "circuit_breaker failure_threshold cannot be zero (route '{}')",
                    route
                );
            }
            if c.half_open_max == 0 {
                anyhow::bail!(
                    "circuit_breaker half_open_max cannot be zero (route '{}')",
                    route
                );
            }
        }
        PolicySpec::Retry(c) => {
            if c.max_retries == 0 {
                anyhow::bail!("retry max_retries cannot be zero (route '{}')", route);
            }
        }
        PolicySpec::Timeout(c) => {
            if c.timeout.is_zero() {
                anyhow::bail!("timeout duration cannot be zero (route '{}')", route);
            }
        }
        PolicySpec::Cache(c) => {
            if c.ttl.is_zero() {
                anyhow::bail!("cache ttl cannot be zero (route '{}')", route);
            }
        }
    }
    Ok(())
}

fn default_gateway_name() -> String {
    "edge-gateway".to_string()
}

fn default_policy_priority() -> i32 {
    100
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

fn default_debug_header() -> String {
    "x-gateway-debug".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_pool_max_idle() -> usize {
    20
}

fn default_user_agent() -> String {
    "edge-gateway/0.1".to_string()
}

fn default_rate_limit_max_keys() -> usize {
    100_000
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_max_fails() -> u32 {
    3
}

fn default_fail_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_max() -> u32 {
    1
}

fn default_timeout_status() -> u16 {
    504
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        if s.ends_with("ms") {
            let num: u64 = s.trim_end_matches("ms").parse()?;
            Ok(Duration::from_millis(num))
        } else if s.ends_with("s") {
            let num: u64 = s.trim_end_matches("s").parse()?;
            Ok(Duration::from_secs(num))
        } else if s.ends_with("m") {
            let num: u64 = s.trim_end_matches("m").parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if s.ends_with("h") {
            let num: u64 = s.trim_end_matches("h").parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            let num: u64 = s.parse()?;
            Ok(Duration::from_secs(num))
        }
    }

}
