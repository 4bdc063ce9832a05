//! Forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! RequestContext (decision = Proxy | ProxyAndCache) + Request<Body>
//!     → PoolRegistry::resolve(host) → ConnectionPool::lease(endpoint)
//!     → [cache enabled] ContentCache::begin_capture, strip validators
//!     → rewrite URI to the endpoint, keep client Host
//!     → hyper client send (bounded by the stuck timeout)
//!     → response head → capture headers, synthesize Expires
//!     → ForwardOutcome::Streaming(Response)
//!           body pump task: backend frame → client channel → capture
//!           end: commit | abort, report success, log access
//!     → ForwardOutcome::Failed(ctx, ForwardError) → pipeline error page
//! ```
//!
//! # Design Decisions
//! - Connect failures and (optionally) stuck requests go to the failure
//!   reporter; pool exhaustion never does
//! - Error pages never carry backend detail; the detail goes to the log

pub mod engine;
pub mod error;

pub use engine::{ForwardOutcome, ForwardSettings, Forwarder};
pub use error::ForwardError;
