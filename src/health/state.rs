//! Per-endpoint health state.
//!
//! # State Transitions
//! ```text
//! Unknown/Healthy → Unhealthy: report_unreachable
//! Unhealthy → Healthy:         report_success
//! Unhealthy → (eligible):      recovery window elapsed, next request probes
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// Health of a single endpoint.
#[derive(Debug)]
pub struct EndpointHealth {
    state: AtomicU8,
    unhealthy_since_ms: AtomicU64,
    failures: AtomicU64,
    reason: Mutex<Option<String>>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(HealthState::Unknown as u8),
            unhealthy_since_ms: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            reason: Mutex::new(None),
        }
    }
}

impl EndpointHealth {
    pub fn state(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Returns true when this report changed the state.
    pub fn mark_unreachable(&self, timestamp_ms: u64, reason: &str) -> bool {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.unhealthy_since_ms.store(timestamp_ms, Ordering::Release);
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason.to_string());
        }
        self.state.swap(HealthState::Unhealthy as u8, Ordering::AcqRel)
            != HealthState::Unhealthy as u8
    }

    /// Returns true when this report changed the state.
    pub fn mark_healthy(&self) -> bool {
        let previous = self.state.swap(HealthState::Healthy as u8, Ordering::AcqRel);
        if previous == HealthState::Unhealthy as u8 {
            if let Ok(mut slot) = self.reason.lock() {
                *slot = None;
            }
            return true;
        }
        false
    }

    /// Millis since epoch of the latest unreachable report.
    pub fn unhealthy_since_ms(&self) -> u64 {
        self.unhealthy_since_ms.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }
}
