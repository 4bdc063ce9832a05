//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Receive unreachable reports from the forwarder
//! - Exclude unreachable endpoints from selection for a recovery window
//! - Restore endpoints on the first successful request
//!
//! # Design Decisions
//! - Only connect failures (and, by policy, stuck requests) are reported;
//!   pool exhaustion is a capacity signal and never reaches this module
//! - After the recovery window an endpoint is eligible again and the next
//!   request acts as the probe

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock;
use crate::health::reporter::FailureReporter;
use crate::health::state::{EndpointHealth, HealthState};
use crate::observability::metrics;
use crate::pool::EndpointKey;

/// Passive health registry shared by the forwarder and the route table.
#[derive(Debug)]
pub struct BackendHealth {
    endpoints: DashMap<EndpointKey, Arc<EndpointHealth>>,
    recovery: Duration,
}

impl BackendHealth {
    pub fn new(recovery: Duration) -> Self {
        Self {
            endpoints: DashMap::new(),
            recovery,
        }
    }

    fn entry(&self, endpoint: &EndpointKey) -> Arc<EndpointHealth> {
        if let Some(existing) = self.endpoints.get(endpoint) {
            return existing.clone();
        }
        self.endpoints
            .entry(endpoint.clone())
            .or_default()
            .clone()
    }

    pub fn state(&self, endpoint: &EndpointKey) -> HealthState {
        self.endpoints
            .get(endpoint)
            .map(|h| h.state())
            .unwrap_or(HealthState::Unknown)
    }

    /// Whether the endpoint may receive traffic right now.
    pub fn is_available(&self, endpoint: &EndpointKey) -> bool {
        self.is_available_at(endpoint, clock::now_millis())
    }

    fn is_available_at(&self, endpoint: &EndpointKey, now_ms: u64) -> bool {
        match self.endpoints.get(endpoint) {
            Some(health) if health.state() == HealthState::Unhealthy => {
                now_ms.saturating_sub(health.unhealthy_since_ms()) >= self.recovery.as_millis() as u64
            }
            _ => true,
        }
    }

    /// Number of unreachable reports received for `endpoint`.
    pub fn failures(&self, endpoint: &EndpointKey) -> u64 {
        self.endpoints.get(endpoint).map(|h| h.failures()).unwrap_or(0)
    }

    pub fn reason(&self, endpoint: &EndpointKey) -> Option<String> {
        self.endpoints.get(endpoint).and_then(|h| h.reason())
    }
}

impl FailureReporter for BackendHealth {
    fn report_unreachable(&self, endpoint: &EndpointKey, timestamp_ms: u64, reason: &str) {
        metrics::record_unreachable_report(&endpoint.to_string());
        if self.entry(endpoint).mark_unreachable(timestamp_ms, reason) {
            tracing::warn!(endpoint = %endpoint, reason = %reason, "Backend marked unreachable");
        }
    }

    fn report_success(&self, endpoint: &EndpointKey) {
        let Some(health) = self.endpoints.get(endpoint).map(|h| h.clone()) else {
            return;
        };
        if health.mark_healthy() {
            tracing::info!(endpoint = %endpoint, "Backend recovered");
        }
    }
}
