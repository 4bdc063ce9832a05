//! Forwarding failures and how each one surfaces to the client.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use crate::http::context::client_closed_request;
use crate::pool::{EndpointKey, PoolError};

#[derive(Debug, Error)]
pub enum ForwardError {
    /// No endpoint slot freed up within the borrow timeout.
    #[error("no free connection to {endpoint} after {waited:?}")]
    PoolExhausted { endpoint: EndpointKey, waited: Duration },

    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: EndpointKey, reason: String },

    /// The backend went quiet for longer than the stuck timeout.
    #[error("{endpoint} sent nothing for {after:?}")]
    Stuck { endpoint: EndpointKey, after: Duration },

    #[error("upstream {endpoint} failed: {reason}")]
    Upstream { endpoint: EndpointKey, reason: String },

    #[error("client disconnected")]
    ClientGone,

    #[error("pool '{0}' was closed")]
    PoolClosed(String),

    #[error("invalid forwarding target: {0}")]
    InvalidTarget(String),
}

impl ForwardError {
    /// Status of the fallback page, if headers are still unsent.
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::PoolExhausted { .. }
            | ForwardError::Connect { .. }
            | ForwardError::PoolClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::Stuck { .. }
            | ForwardError::Upstream { .. }
            | ForwardError::InvalidTarget(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Nobody reads it; recorded in the access log only.
            ForwardError::ClientGone => client_closed_request(),
        }
    }

    /// Endpoint this failure is about, if any.
    pub fn endpoint(&self) -> Option<&EndpointKey> {
        match self {
            ForwardError::PoolExhausted { endpoint, .. }
            | ForwardError::Connect { endpoint, .. }
            | ForwardError::Stuck { endpoint, .. }
            | ForwardError::Upstream { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    /// Whether the failure says something about backend liveness.
    pub fn reports_unreachable(&self, stuck_marks_unreachable: bool) -> bool {
        match self {
            ForwardError::Connect { .. } => true,
            ForwardError::Stuck { .. } => stuck_marks_unreachable,
            _ => false,
        }
    }
}

impl From<PoolError> for ForwardError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted { endpoint, waited } => ForwardError::PoolExhausted { endpoint, waited },
            PoolError::Closed(id) => ForwardError::PoolClosed(id),
        }
    }
}
