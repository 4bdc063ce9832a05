//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up the matching route for a request
//! - Turn the match into a [`RoutingDecision`]
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan in priority order (acceptable for typical route counts)
//! - Unmatched requests get an explicit not-found decision
//! - ACME challenge paths are answered before any route is consulted

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use thiserror::Error;

use crate::config::schema::{
    HeaderMutationConfig, HeaderOp, PageConfig, ProxyConfig, RedirectConfig, RouteAction,
    RouteConfig,
};
use crate::health::BackendHealth;
use crate::pool::{EndpointError, EndpointKey};
use crate::routing::decision::{
    Action, HeaderMutation, PageSpec, RedirectScheme, RedirectTarget, RoutingDecision,
};
use crate::routing::mapper::{Mapper, RequestView};
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};
use crate::routing::round_robin::BackendGroup;

/// Path prefix of ACME HTTP-01 challenge tokens.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Route id of requests no route matched.
pub const UNMATCHED_ROUTE: &str = "unmatched";

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("backend '{name}' has an invalid address: {source}")]
    InvalidBackend {
        name: String,
        #[source]
        source: EndpointError,
    },

    #[error("route '{route}' references unknown backend group '{group}'")]
    UnknownGroup { route: String, group: String },

    #[error("route '{0}' has an invalid header mutation")]
    InvalidHeader(String),

    #[error("the fixed mapper needs routing.fixed_group")]
    MissingFixedGroup,

    #[error("unknown mapper '{0}'")]
    UnknownMapper(String),
}

/// Compile configured header mutations. Invalid names or values yield `None`.
pub fn compile_mutations(configs: &[HeaderMutationConfig]) -> Option<Vec<HeaderMutation>> {
    configs
        .iter()
        .map(|c| {
            let name = HeaderName::from_bytes(c.name.trim().as_bytes()).ok()?;
            Some(match c.op {
                HeaderOp::Remove => HeaderMutation::Remove(name),
                HeaderOp::Set => HeaderMutation::Set(name, HeaderValue::from_str(&c.value).ok()?),
                HeaderOp::Add => HeaderMutation::Add(name, HeaderValue::from_str(&c.value).ok()?),
            })
        })
        .collect()
}

fn compile_page(config: &PageConfig) -> PageSpec {
    PageSpec {
        status: StatusCode::from_u16(config.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        resource: Some(config.resource.clone()),
        headers: Vec::new(),
    }
}

fn compile_redirect(config: &RedirectConfig) -> RedirectTarget {
    let scheme = if config.scheme.eq_ignore_ascii_case("https") {
        RedirectScheme::Https
    } else {
        RedirectScheme::Http
    };
    RedirectTarget {
        location: config.location.clone(),
        scheme,
        host: config.host.clone(),
        port: config.port,
        status: config
            .status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::FOUND),
    }
}

/// Backend groups keyed by name, built from the `backends` section.
pub fn build_groups(config: &ProxyConfig) -> Result<HashMap<String, Arc<BackendGroup>>, RoutingError> {
    let mut grouped: HashMap<String, Vec<EndpointKey>> = HashMap::new();
    for backend in &config.backends {
        let endpoint: EndpointKey =
            backend
                .address
                .parse()
                .map_err(|source| RoutingError::InvalidBackend {
                    name: backend.name.clone(),
                    source,
                })?;
        grouped.entry(backend.group.clone()).or_default().push(endpoint);
    }
    Ok(grouped
        .into_iter()
        .map(|(name, endpoints)| (name, Arc::new(BackendGroup::new(endpoints))))
        .collect())
}

/// Every backend endpoint named in the configuration, deduplicated.
pub fn configured_endpoints(config: &ProxyConfig) -> Vec<EndpointKey> {
    let mut endpoints: Vec<EndpointKey> = config
        .backends
        .iter()
        .filter_map(|b| b.address.parse().ok())
        .collect();
    endpoints.sort();
    endpoints.dedup();
    endpoints
}

#[derive(Debug)]
struct SitePages {
    not_found: Option<PageSpec>,
    internal_error: Option<PageSpec>,
}

impl SitePages {
    fn from_config(config: &ProxyConfig) -> Self {
        Self {
            not_found: config.pages.not_found.as_ref().map(compile_page),
            internal_error: config.pages.internal_error.as_ref().map(compile_page),
        }
    }
}

#[derive(Debug)]
struct CompiledRoute {
    name: String,
    matcher: AndMatcher,
    action: RouteAction,
    group: Option<Arc<BackendGroup>>,
    resource: Option<String>,
    redirect: Option<RedirectTarget>,
    headers: Vec<HeaderMutation>,
    not_found: Option<PageSpec>,
    internal_error: Option<PageSpec>,
}

impl CompiledRoute {
    fn compile(
        config: &RouteConfig,
        groups: &HashMap<String, Arc<BackendGroup>>,
    ) -> Result<Self, RoutingError> {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &config.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        if let Some(prefix) = &config.path_prefix {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
        }

        let group = match (&config.backend_group, config.action) {
            (Some(name), _) => Some(groups.get(name).cloned().ok_or_else(|| {
                RoutingError::UnknownGroup {
                    route: config.name.clone(),
                    group: name.clone(),
                }
            })?),
            (None, RouteAction::Proxy | RouteAction::ProxyAndCache) => {
                return Err(RoutingError::UnknownGroup {
                    route: config.name.clone(),
                    group: String::new(),
                })
            }
            (None, _) => None,
        };

        let headers = compile_mutations(&config.headers)
            .ok_or_else(|| RoutingError::InvalidHeader(config.name.clone()))?;

        Ok(Self {
            name: config.name.clone(),
            matcher: AndMatcher::new(matchers),
            action: config.action,
            group,
            resource: config.resource.clone(),
            redirect: config.redirect.as_ref().map(compile_redirect),
            headers,
            not_found: config.not_found_page.as_ref().map(compile_page),
            internal_error: config.internal_error_page.as_ref().map(compile_page),
        })
    }
}

/// Priority-ordered route table; the default mapper.
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
    pages: SitePages,
    health: Arc<BackendHealth>,
}

impl RouteTable {
    pub fn new(config: &ProxyConfig, health: Arc<BackendHealth>) -> Result<Self, RoutingError> {
        let groups = build_groups(config)?;

        let mut sorted: Vec<&RouteConfig> = config.routes.iter().collect();
        // Stable: equal priorities keep configuration order.
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        let routes = sorted
            .into_iter()
            .map(|route| CompiledRoute::compile(route, &groups))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            routes,
            pages: SitePages::from_config(config),
            health,
        })
    }

    fn route(&self, route_id: &str) -> Option<&CompiledRoute> {
        self.routes.iter().find(|r| r.name == route_id)
    }

    fn decide(&self, route: &CompiledRoute) -> RoutingDecision {
        let mut decision = match route.action {
            RouteAction::Proxy | RouteAction::ProxyAndCache => {
                let cache = route.action == RouteAction::ProxyAndCache;
                let target = route
                    .group
                    .as_ref()
                    .and_then(|g| g.next(|e| self.health.is_available(e)));
                match target {
                    Some(target) => RoutingDecision::proxy(&route.name, target, cache),
                    None => RoutingDecision::internal_error(&route.name, "no backend in group"),
                }
            }
            RouteAction::Static => RoutingDecision {
                resource: route.resource.clone(),
                ..RoutingDecision::new(Action::Static, &route.name)
            },
            RouteAction::Redirect => RoutingDecision {
                redirect: Some(route.redirect.clone().unwrap_or_default()),
                ..RoutingDecision::new(Action::Redirect, &route.name)
            },
            RouteAction::NotFound => RoutingDecision {
                page: route.not_found.clone(),
                ..RoutingDecision::not_found(&route.name)
            },
            RouteAction::InternalError => RoutingDecision {
                page: route.internal_error.clone(),
                ..RoutingDecision::internal_error(&route.name, "configured")
            },
        };
        decision.headers = route.headers.clone();
        decision
    }
}

impl Mapper for RouteTable {
    fn map(&self, request: &RequestView<'_>) -> Option<RoutingDecision> {
        let path = request.path();
        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            if !token.is_empty() && !token.contains('/') {
                return Some(RoutingDecision {
                    resource: Some(path.trim_start_matches('/').to_string()),
                    ..RoutingDecision::new(Action::AcmeChallenge, "acme")
                });
            }
        }

        let decision = match self.routes.iter().find(|r| r.matcher.matches(request)) {
            Some(route) => self.decide(route),
            None => RoutingDecision::not_found(UNMATCHED_ROUTE),
        };
        Some(decision)
    }

    fn not_found_page(&self, route_id: &str) -> Option<PageSpec> {
        self.route(route_id)
            .and_then(|r| r.not_found.clone())
            .or_else(|| self.pages.not_found.clone())
    }

    fn internal_error_page(&self, route_id: &str) -> Option<PageSpec> {
        self.route(route_id)
            .and_then(|r| r.internal_error.clone())
            .or_else(|| self.pages.internal_error.clone())
    }
}

/// Sends every request to one backend group.
pub struct FixedMapper {
    group_name: String,
    group: Arc<BackendGroup>,
    pages: SitePages,
    health: Arc<BackendHealth>,
}

impl FixedMapper {
    pub fn new(config: &ProxyConfig, health: Arc<BackendHealth>) -> Result<Self, RoutingError> {
        let group_name = config
            .routing
            .fixed_group
            .clone()
            .ok_or(RoutingError::MissingFixedGroup)?;
        let group = build_groups(config)?
            .remove(&group_name)
            .ok_or_else(|| RoutingError::UnknownGroup {
                route: "fixed".to_string(),
                group: group_name.clone(),
            })?;
        Ok(Self {
            group_name,
            group,
            pages: SitePages::from_config(config),
            health,
        })
    }
}

impl Mapper for FixedMapper {
    fn map(&self, _request: &RequestView<'_>) -> Option<RoutingDecision> {
        let target = self.group.next(|e| self.health.is_available(e))?;
        Some(RoutingDecision::proxy(&self.group_name, target, false))
    }

    fn not_found_page(&self, _route_id: &str) -> Option<PageSpec> {
        self.pages.not_found.clone()
    }

    fn internal_error_page(&self, _route_id: &str) -> Option<PageSpec> {
        self.pages.internal_error.clone()
    }
}
