//! Edge reverse proxy data plane.
//!
//! Requests are mapped to a routing decision, answered from static content,
//! redirected, served from the in-memory content cache, or forwarded to a
//! backend through a per-domain connection pool.

pub mod cache;
pub mod clock;
pub mod config;
pub mod content;
pub mod forward;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod pool;
pub mod routing;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
