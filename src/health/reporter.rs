//! The narrow interface the data plane uses to signal backend failures.

use crate::pool::EndpointKey;

/// Receives liveness signals about backend endpoints.
///
/// Implementations must be cheap, idempotent and must never fail back into
/// the caller; they are invoked inline on the request path.
pub trait FailureReporter: Send + Sync {
    /// The endpoint refused a connection or stopped responding.
    fn report_unreachable(&self, endpoint: &EndpointKey, timestamp_ms: u64, reason: &str);

    /// A request to the endpoint completed.
    fn report_success(&self, _endpoint: &EndpointKey) {}
}

/// Reporter that ignores every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl FailureReporter for NoopReporter {
    fn report_unreachable(&self, _endpoint: &EndpointKey, _timestamp_ms: u64, _reason: &str) {}
}
