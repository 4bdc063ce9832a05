//! Round-robin selection over a backend group.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::pool::EndpointKey;

/// A named set of endpoints with a rotating cursor.
#[derive(Debug, Default)]
pub struct BackendGroup {
    endpoints: Vec<EndpointKey>,
    counter: AtomicUsize,
}

impl BackendGroup {
    pub fn new(endpoints: Vec<EndpointKey>) -> Self {
        Self {
            endpoints,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn endpoints(&self) -> &[EndpointKey] {
        &self.endpoints
    }

    /// Next endpoint for which `available` holds, rotating on every call.
    ///
    /// When every endpoint is unavailable the plain rotation is used, so the
    /// request still reaches a backend and its failure is reported.
    pub fn next(&self, available: impl Fn(&EndpointKey) -> bool) -> Option<EndpointKey> {
        let len = self.endpoints.len();
        if len == 0 {
            return None;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        for i in 0..len {
            let endpoint = &self.endpoints[(start + i) % len];
            if available(endpoint) {
                return Some(endpoint.clone());
            }
        }
        Some(self.endpoints[start % len].clone())
    }
}
