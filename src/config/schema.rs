//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Domain pattern of the pool every unmatched host falls back to.
pub const DEFAULT_POOL_DOMAIN: &str = "*";

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Logging, metrics and access log settings.
    pub observability: ObservabilityConfig,

    /// Forwarding engine behaviour.
    pub forwarding: ForwardingConfig,

    /// Content cache limits.
    pub cache: CacheConfig,

    /// Connection pool policies. A `*` policy is synthesized when absent.
    pub pools: Vec<PoolConfig>,

    /// Which mapper strategy turns requests into routing decisions.
    pub routing: RoutingConfig,

    /// Route definitions consumed by the `routes` mapper.
    pub routes: Vec<RouteConfig>,

    /// Backend server definitions.
    pub backends: Vec<BackendConfig>,

    /// Passive health settings.
    pub health: HealthConfig,

    /// Static and error pages.
    pub pages: PagesConfig,
}

impl ProxyConfig {
    /// Pool policies with the default `*` policy guaranteed to be present.
    pub fn effective_pools(&self) -> Vec<PoolConfig> {
        let mut pools = self.pools.clone();
        if !pools.iter().any(PoolConfig::is_default) {
            pools.push(PoolConfig::default());
        }
        pools
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
}

/// Access log record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessLogFormat {
    /// One tracing event with one field per record attribute.
    #[default]
    Fields,
    /// One tracing event carrying the record as a JSON line.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Emit one access record per finished request.
    pub access_log_enabled: bool,

    pub access_log_format: AccessLogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
            access_log_enabled: true,
            access_log_format: AccessLogFormat::Fields,
        }
    }
}

/// Forwarding engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Max wait for response headers or for the next body chunk.
    pub stuck_timeout_ms: u64,

    /// Whether a stuck request reports its backend unreachable.
    pub mark_stuck_unreachable: bool,

    /// Accept gzip-encoded request bodies and decode them before forwarding.
    pub request_compression: bool,

    /// Gzip responses for clients that accept it.
    pub response_compression: bool,

    /// Upper bound for producing response headers, in seconds.
    pub request_timeout_secs: u64,
}

impl ForwardingConfig {
    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_millis(self.stuck_timeout_ms)
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            stuck_timeout_ms: 30_000,
            mark_stuck_unreachable: false,
            request_compression: false,
            response_compression: false,
            request_timeout_secs: 60,
        }
    }
}

/// Content cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Aggregate memory budget (heap + direct) in bytes.
    pub max_size_bytes: u64,

    /// Largest single response body that may be cached.
    pub max_file_size_bytes: u64,

    /// Refuse to cache TLS requests unless they send `Cache-Control: public`.
    pub disable_secure_without_public: bool,

    /// TTL applied when the backend sends no `Expires`.
    pub default_ttl_secs: u64,

    /// Interval of the background expiry/eviction sweep.
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 256 * 1024 * 1024,
            max_file_size_bytes: 8 * 1024 * 1024,
            disable_secure_without_public: true,
            default_ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

/// TCP keep-alive probing for backend connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub idle_secs: u64,
    pub interval_secs: u64,
    pub count: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            interval_secs: 10,
            count: 3,
        }
    }
}

/// One connection pool policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Unique pool identifier (used in metrics and logs).
    pub id: String,

    /// `*`, `*.example.com` or an exact host.
    pub domain: String,

    /// Concurrent requests allowed per backend endpoint.
    pub max_connections_per_endpoint: usize,

    /// Max wait for a free slot before the request fails with 503.
    pub borrow_timeout_ms: u64,

    pub connect_timeout_ms: u64,

    /// Idle time after which a resting connection is closed.
    pub idle_timeout_ms: u64,

    /// Age after which new requests stop using existing connections.
    pub max_lifetime_ms: u64,

    /// How long a replaced pool may drain before it is force-closed.
    pub dispose_timeout_ms: u64,

    pub keep_alive: KeepAliveConfig,

    pub enabled: bool,
}

impl PoolConfig {
    pub fn is_default(&self) -> bool {
        self.domain.trim() == DEFAULT_POOL_DOMAIN
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            domain: DEFAULT_POOL_DOMAIN.to_string(),
            max_connections_per_endpoint: 128,
            borrow_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 90_000,
            max_lifetime_ms: 600_000,
            dispose_timeout_ms: 30_000,
            keep_alive: KeepAliveConfig::default(),
            enabled: true,
        }
    }
}

/// Mapper strategy selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Registered mapper id (`routes` or `fixed`).
    pub mapper: String,

    /// Backend group used by the `fixed` mapper.
    pub fixed_group: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mapper: "routes".to_string(),
            fixed_group: None,
        }
    }
}

/// What a matched route does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    #[default]
    Proxy,
    ProxyAndCache,
    Static,
    Redirect,
    NotFound,
    InternalError,
}

/// Redirect target of a `redirect` route.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RedirectConfig {
    /// Absolute URL; when set it is used verbatim.
    pub location: Option<String>,

    /// Scheme forced on composed locations (`http` or `https`).
    pub scheme: String,

    /// Host of composed locations; the request host when absent.
    pub host: Option<String>,

    pub port: Option<u16>,

    /// Response status, 302 when absent.
    pub status: Option<u16>,
}

/// Header mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOp {
    Set,
    Add,
    Remove,
}

/// A response header mutation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderMutationConfig {
    pub op: HeaderOp,
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// A status code plus the resource rendered with it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageConfig {
    pub status: u16,
    pub resource: String,
}

/// Route configuration mapping requests to an action.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,

    #[serde(default)]
    pub action: RouteAction,

    /// Backend group name for proxy actions.
    pub backend_group: Option<String>,

    /// Resource id for `static` routes.
    pub resource: Option<String>,

    pub redirect: Option<RedirectConfig>,

    #[serde(default)]
    pub headers: Vec<HeaderMutationConfig>,

    pub not_found_page: Option<PageConfig>,

    pub internal_error_page: Option<PageConfig>,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Backend group this server belongs to.
    pub group: String,

    /// Backend address (e.g., "127.0.0.1:3000").
    pub address: String,
}

/// Passive health configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds an unreachable backend is skipped before it is tried again.
    pub recovery_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { recovery_secs: 10 }
    }
}

/// Static page configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PagesConfig {
    /// Directory whose files are preloaded as static resources.
    pub root: Option<String>,

    /// Site-wide not-found page.
    pub not_found: Option<PageConfig>,

    /// Site-wide internal-error page.
    pub internal_error: Option<PageConfig>,
}
