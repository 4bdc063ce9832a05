//! Static content subsystem.
//!
//! # Data Flow
//! ```text
//! Pipeline outcome NotFound / InternalError / Static / AcmeChallenge,
//! or a forwarding failure before headers were sent:
//!     → pages.rs StaticContent::render_page(status, resource)
//!     → RenderedPage (status, headers, body)
//! ```
//!
//! # Design Decisions
//! - Resources are preloaded at startup; no disk access per request
//! - Generic pages never contain backend error detail

pub mod pages;

pub use pages::{RenderedPage, StaticContent, StaticPages};
