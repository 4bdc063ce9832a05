//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path, headers)
//!     → mapper.rs RequestView
//!     → registry.rs picks the configured Mapper (routes | fixed)
//!     → router.rs (route lookup, matcher.rs conditions)
//!     → round_robin.rs picks a healthy backend for proxy routes
//!     → decision.rs RoutingDecision (action, target, headers, pages)
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[]
//!     → Sort by priority
//!     → Compile matchers, header mutations, pages
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Routes compiled at load time, immutable at runtime
//! - No regex in hot path (prefix matching only)
//! - First match wins (ordered by priority)
//! - The pipeline only sees the `Mapper` trait

pub mod decision;
pub mod mapper;
pub mod matcher;
pub mod registry;
pub mod round_robin;
pub mod router;

pub use decision::{
    apply_mutations, Action, HeaderMutation, PageSpec, RedirectScheme, RedirectTarget,
    RoutingDecision,
};
pub use mapper::{Mapper, RequestView};
pub use registry::MapperRegistry;
pub use router::{FixedMapper, RouteTable, RoutingError};
