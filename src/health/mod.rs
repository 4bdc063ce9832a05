//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarder observes a connect failure or stuck request:
//!     → reporter.rs FailureReporter::report_unreachable
//!     → passive.rs marks the endpoint Unhealthy (state.rs)
//!
//! Route table selects a backend:
//!     → passive.rs is_available() skips Unhealthy endpoints until the
//!       recovery window elapses
//!
//! Forwarder completes a request:
//!     → report_success() restores the endpoint
//! ```
//!
//! # Design Decisions
//! - Reports are fire-and-forget and idempotent
//! - Health state is per endpoint, not per pool

pub mod passive;
pub mod reporter;
pub mod state;

pub use passive::BackendHealth;
pub use reporter::{FailureReporter, NoopReporter};
pub use state::HealthState;
