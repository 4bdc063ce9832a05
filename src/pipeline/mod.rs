//! Request pipeline subsystem.
//!
//! # Data Flow
//! ```text
//! axum handler (ConnectionInfo, Request<Body>)
//!     → Mapper::map(RequestView) → RoutingDecision (or no-route)
//!     → RequestContext::new
//!     → dispatch by action:
//!           NotFound / InternalError → configured or generic page
//!           Static / AcmeChallenge   → StaticContent resource
//!           Redirect                 → redirect.rs Location
//!           Proxy                    → Forwarder (no cache)
//!           ProxyAndCache            → ContentCache hit (304 aware)
//!                                      or Forwarder (capturing)
//!     → header mutations
//!     → Response; RequestContext drop → access record
//! ```
//!
//! # Design Decisions
//! - Exactly one response per request; the context is consumed by the
//!   branch that produced it
//! - The mapper is swapped atomically on reload; in-flight requests keep the
//!   one they were mapped with

pub mod orchestrator;
pub mod redirect;

pub use orchestrator::Pipeline;
pub use redirect::compose_location;
