//! Routing decisions: the per-request contract between mapper and pipeline.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::pool::EndpointKey;

/// Route id used when the mapper produced no usable decision.
pub const NO_ROUTE: &str = "no-route";

/// What the pipeline should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Proxy,
    ProxyAndCache,
    Static,
    Redirect,
    NotFound,
    InternalError,
    AcmeChallenge,
}

impl Action {
    /// Stable identifier used in logs and metrics.
    pub fn id(&self) -> &'static str {
        match self {
            Action::Proxy => "proxy",
            Action::ProxyAndCache => "proxy_and_cache",
            Action::Static => "static",
            Action::Redirect => "redirect",
            Action::NotFound => "not_found",
            Action::InternalError => "internal_error",
            Action::AcmeChallenge => "acme_challenge",
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Action::Proxy | Action::ProxyAndCache)
    }
}

/// A response header change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderMutation {
    /// Replace every value of the header.
    Set(HeaderName, HeaderValue),
    /// Append a value.
    Add(HeaderName, HeaderValue),
    /// Delete the header.
    Remove(HeaderName),
}

/// Apply `mutations` in order.
pub fn apply_mutations(headers: &mut HeaderMap, mutations: &[HeaderMutation]) {
    for mutation in mutations {
        match mutation {
            HeaderMutation::Set(name, value) => {
                headers.remove(name);
                headers.append(name.clone(), value.clone());
            }
            HeaderMutation::Add(name, value) => {
                headers.append(name.clone(), value.clone());
            }
            HeaderMutation::Remove(name) => {
                headers.remove(name);
            }
        }
    }
}

/// Scheme a redirect is forced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectScheme {
    #[default]
    Http,
    Https,
}

impl RedirectScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectScheme::Http => "http",
            RedirectScheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            RedirectScheme::Http => 80,
            RedirectScheme::Https => 443,
        }
    }

    pub fn is_default_port(&self, port: u16) -> bool {
        self.default_port() == port
    }
}

/// Where a redirect points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    /// Used verbatim when present.
    pub location: Option<String>,
    pub scheme: RedirectScheme,
    /// Request host when absent.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub status: StatusCode,
}

impl Default for RedirectTarget {
    fn default() -> Self {
        Self {
            location: None,
            scheme: RedirectScheme::Http,
            host: None,
            port: None,
            status: StatusCode::FOUND,
        }
    }
}

/// A status code plus the static resource rendered with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpec {
    pub status: StatusCode,
    pub resource: Option<String>,
    pub headers: Vec<HeaderMutation>,
}

/// The outcome of mapping one request. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub action: Action,
    pub route_id: String,
    /// Backend for proxy actions.
    pub target: Option<EndpointKey>,
    pub redirect: Option<RedirectTarget>,
    /// Resource for `Static` and `AcmeChallenge`.
    pub resource: Option<String>,
    /// Page override for `NotFound` / `InternalError`.
    pub page: Option<PageSpec>,
    pub headers: Vec<HeaderMutation>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Why an error decision was produced.
    pub reason: Option<String>,
}

impl RoutingDecision {
    pub fn new(action: Action, route_id: impl Into<String>) -> Self {
        Self {
            action,
            route_id: route_id.into(),
            target: None,
            redirect: None,
            resource: None,
            page: None,
            headers: Vec::new(),
            user_id: None,
            session_id: None,
            reason: None,
        }
    }

    pub fn proxy(route_id: impl Into<String>, target: EndpointKey, cache: bool) -> Self {
        let action = if cache { Action::ProxyAndCache } else { Action::Proxy };
        Self {
            target: Some(target),
            ..Self::new(action, route_id)
        }
    }

    pub fn not_found(route_id: impl Into<String>) -> Self {
        Self::new(Action::NotFound, route_id)
    }

    pub fn internal_error(route_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(Action::InternalError, route_id)
        }
    }

    /// Decision used when the mapper produced nothing.
    pub fn no_route() -> Self {
        Self::internal_error(NO_ROUTE, "no route")
    }

    pub fn with_headers(mut self, headers: Vec<HeaderMutation>) -> Self {
        self.headers = headers;
        self
    }
}
