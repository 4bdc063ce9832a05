//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, ConnectionInfo)
//!     → context.rs RequestContext (id, timestamps, decision)
//!     → pipeline (dispatch by routing decision)
//!     → Send to client
//!     → RequestContext dropped → access record
//! ```

pub mod context;
pub mod server;

pub use context::{ConnectionInfo, RequestContext, TlsInfo};
pub use server::{BuildError, Collaborators, HttpServer, Reloader};
