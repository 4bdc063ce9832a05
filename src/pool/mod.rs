//! Connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarder needs backend B for host H:
//!     → registry.rs: first enabled policy whose domain pattern matches H,
//!       else the `*` default
//!     → connection_pool.rs: per-endpoint client + slot (bounded borrow wait)
//!     → Lease (RAII) held until the response body is finished
//!
//! On reload:
//!     registry.rs builds a new PoolSet (one pool per policy, every known
//!     endpoint pre-provisioned)
//!     → atomic swap (ArcSwap)
//!     → old pools drain in the background, then force-close
//!     → pool metric series unregistered by their drop guard
//! ```
//!
//! # Design Decisions
//! - Linear scan over policies; pool counts are operator-sized
//! - Unknown hosts always fall back to the default pool
//! - Limits are per (pool, endpoint), so two policies never share a cap
//! - Pool idle/lifetime timers govern resting connections only; request
//!   read timeouts live in the forwarder

pub mod connection_pool;
pub mod endpoint;
pub mod policy;
pub mod registry;

pub use connection_pool::{ConnectionPool, HttpClient, Lease, PoolError};
pub use endpoint::{EndpointError, EndpointKey, EndpointStats};
pub use policy::{DomainPattern, PoolPolicy};
pub use registry::{PoolRegistry, PoolSet};
