//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, cache, forwarding, pools)
//! - Expose Prometheus-compatible metrics endpoint
//! - Scope per-pool series to the pool that owns them
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by action, status
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_cache_lookups_total` (counter): lookups by result (hit/miss)
//! - `proxy_cache_evictions_total` (counter): entries removed by maintenance
//! - `proxy_cache_bytes` (gauge): memory by pool (heap/direct)
//! - `proxy_forward_pending` (gauge): forwards awaiting completion
//! - `proxy_stuck_requests_total` (counter): backend read timeouts
//! - `proxy_unreachable_reports_total` (counter): reports sent to health
//! - `proxy_pool_in_flight` (gauge): leased slots per pool generation
//! - `proxy_pool_endpoints` (gauge): provisioned endpoints per pool generation
//!
//! # Design Decisions
//! - Pool series carry a `generation` label; the guard that registered them
//!   zeroes and forgets them on drop, and the exporter's gauge idle timeout
//!   removes them from the scrape output
//! - Everything else goes through the global `metrics` recorder

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, gauge, histogram, Gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::MetricKindMask;

/// How long an untouched gauge series survives in the exporter.
const GAUGE_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    let result = PrometheusBuilder::new()
        .with_http_listener(addr)
        .idle_timeout(MetricKindMask::GAUGE, Some(GAUGE_IDLE_TIMEOUT))
        .install();

    match result {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a finished request.
pub fn record_request(action: &'static str, status: u16, start: Instant) {
    counter!(
        "proxy_requests_total",
        "action" => action,
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "action" => action)
        .record(start.elapsed().as_secs_f64());
}

/// Record a request-driven cache lookup.
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("proxy_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_cache_evictions(count: u64) {
    counter!("proxy_cache_evictions_total").increment(count);
}

pub fn record_cache_usage(heap_bytes: u64, direct_bytes: u64) {
    gauge!("proxy_cache_bytes", "pool" => "heap").set(heap_bytes as f64);
    gauge!("proxy_cache_bytes", "pool" => "direct").set(direct_bytes as f64);
}

pub fn record_pending_forwards(pending: usize) {
    gauge!("proxy_forward_pending").set(pending as f64);
}

pub fn record_stuck_request(endpoint: &str) {
    counter!("proxy_stuck_requests_total", "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_unreachable_report(endpoint: &str) {
    counter!("proxy_unreachable_reports_total", "endpoint" => endpoint.to_string())
        .increment(1);
}

/// The set of pool metric series currently registered.
///
/// Owned by the pool registry; each [`PoolMetrics`] guard removes its own
/// entry when dropped.
#[derive(Debug, Clone, Default)]
pub struct MetricsScope {
    live: Arc<DashMap<(String, u64), ()>>,
}

impl MetricsScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the series of one pool generation.
    pub fn register_pool(&self, pool_id: &str, generation: u64) -> PoolMetrics {
        self.live.insert((pool_id.to_string(), generation), ());

        PoolMetrics {
            scope: self.live.clone(),
            key: (pool_id.to_string(), generation),
            in_flight: gauge!(
                "proxy_pool_in_flight",
                "pool" => pool_id.to_string(),
                "generation" => generation.to_string()
            ),
            endpoints: gauge!(
                "proxy_pool_endpoints",
                "pool" => pool_id.to_string(),
                "generation" => generation.to_string()
            ),
        }
    }

    /// Number of pool generations with live series.
    pub fn live_series(&self) -> usize {
        self.live.len()
    }

    pub fn is_registered(&self, pool_id: &str, generation: u64) -> bool {
        self.live.contains_key(&(pool_id.to_string(), generation))
    }
}

/// Registration guard for one pool generation's gauges.
pub struct PoolMetrics {
    scope: Arc<DashMap<(String, u64), ()>>,
    key: (String, u64),
    in_flight: Gauge,
    endpoints: Gauge,
}

impl PoolMetrics {
    pub fn set_in_flight(&self, value: usize) {
        self.in_flight.set(value as f64);
    }

    pub fn set_endpoints(&self, value: usize) {
        self.endpoints.set(value as f64);
    }
}

impl Drop for PoolMetrics {
    fn drop(&mut self) {
        self.in_flight.set(0.0);
        self.endpoints.set(0.0);
        self.scope.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_metrics_unregister_on_drop() {
        let scope = MetricsScope::new();
        let first = scope.register_pool("default", 1);
        let second = scope.register_pool("default", 2);
        assert_eq!(scope.live_series(), 2);

        drop(first);
        assert!(!scope.is_registered("default", 1));
        assert!(scope.is_registered("default", 2));

        drop(second);
        assert_eq!(scope.live_series(), 0);
    }
}
