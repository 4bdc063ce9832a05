//! The mapper contract consumed by the request pipeline.

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, Method, Uri};

use crate::routing::decision::{PageSpec, RoutingDecision};

/// Read-only view of an inbound request handed to a [`Mapper`].
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub peer: SocketAddr,
    pub secure: bool,
}

impl<'a> RequestView<'a> {
    /// Host header (or URI authority), as sent.
    pub fn host(&self) -> Option<&'a str> {
        self.headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
    }

    pub fn path(&self) -> &'a str {
        self.uri.path()
    }
}

/// Turns requests into routing decisions.
pub trait Mapper: Send + Sync {
    /// Decide what to do with `request`. `None` means no decision could be
    /// produced; the pipeline answers with an internal error.
    fn map(&self, request: &RequestView<'_>) -> Option<RoutingDecision>;

    /// Not-found page for `route_id` when the decision carries none.
    fn not_found_page(&self, route_id: &str) -> Option<PageSpec>;

    /// Internal-error page for `route_id` when the decision carries none.
    fn internal_error_page(&self, route_id: &str) -> Option<PageSpec>;
}
