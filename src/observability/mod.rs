//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms; pool-scoped guards)
//!
//! Request pipeline, once per finished request:
//!     → access.rs AccessRecord → AccessLogSink
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request id flows through all log events of a request
//! - Metrics are cheap (atomic increments)
//! - Pool metrics are unregistered when their pool is disposed

pub mod access;
pub mod logging;
pub mod metrics;
