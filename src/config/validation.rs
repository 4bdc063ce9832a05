//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing backend groups)
//! - Validate value ranges (timeouts > 0, sizes consistent)
//! - Check strategy ids against the mapper registry
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{PageConfig, PoolConfig, ProxyConfig, RedirectConfig, RouteAction};
use crate::pool::EndpointKey;
use crate::routing::router::compile_mutations;
use crate::routing::MapperRegistry;

/// One semantic problem, located by a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate against the built-in mapper strategies.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    validate_with(config, &MapperRegistry::builtin())
}

/// Validate against a caller-provided mapper registry.
pub fn validate_with(config: &ProxyConfig, mappers: &MapperRegistry) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_listener(config, &mut errors);
    validate_forwarding(config, &mut errors);
    validate_cache(config, &mut errors);
    validate_pools(&config.pools, &mut errors);
    let groups = validate_backends(config, &mut errors);
    validate_routing(config, mappers, &groups, &mut errors);
    validate_routes(config, &groups, &mut errors);
    validate_pages(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }
    let obs = &config.observability;
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", obs.metrics_address),
        ));
    }
}

fn validate_forwarding(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    if config.forwarding.stuck_timeout_ms == 0 {
        errors.push(ValidationError::new("forwarding.stuck_timeout_ms", "must be > 0"));
    }
    if config.forwarding.request_timeout_secs == 0 {
        errors.push(ValidationError::new("forwarding.request_timeout_secs", "must be > 0"));
        return;
    }

    // The outer request timeout must leave room for the forwarder's own
    // borrow and stuck timeouts, or those never get to answer.
    let borrow_ms = config
        .effective_pools()
        .iter()
        .map(|p| p.borrow_timeout_ms)
        .max()
        .unwrap_or(0);
    let inner_ms = borrow_ms.saturating_add(config.forwarding.stuck_timeout_ms);
    let outer_ms = config.forwarding.request_timeout_secs.saturating_mul(1000);
    if outer_ms <= inner_ms {
        errors.push(ValidationError::new(
            "forwarding.request_timeout_secs",
            format!("{outer_ms}ms must exceed the largest pool borrow timeout plus forwarding.stuck_timeout_ms ({inner_ms}ms)"),
        ));
    }
}

fn validate_cache(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    let cache = &config.cache;
    if cache.max_file_size_bytes > cache.max_size_bytes {
        errors.push(ValidationError::new(
            "cache.max_file_size_bytes",
            format!(
                "{} exceeds cache.max_size_bytes ({})",
                cache.max_file_size_bytes, cache.max_size_bytes
            ),
        ));
    }
    if cache.default_ttl_secs == 0 {
        errors.push(ValidationError::new("cache.default_ttl_secs", "must be > 0"));
    }
    if cache.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("cache.sweep_interval_secs", "must be > 0"));
    }
}

fn validate_pools(pools: &[PoolConfig], errors: &mut Vec<ValidationError>) {
    let mut ids = HashSet::new();
    let mut defaults = 0;

    for (i, pool) in pools.iter().enumerate() {
        let field = |name: &str| format!("pools[{i}].{name}");

        if pool.id.trim().is_empty() {
            errors.push(ValidationError::new(field("id"), "must not be empty"));
        } else if !ids.insert(pool.id.as_str()) {
            errors.push(ValidationError::new(field("id"), format!("duplicate pool id '{}'", pool.id)));
        }
        if pool.domain.trim().is_empty() {
            errors.push(ValidationError::new(field("domain"), "must not be empty"));
        }
        if pool.is_default() {
            defaults += 1;
        }
        if pool.max_connections_per_endpoint == 0 {
            errors.push(ValidationError::new(field("max_connections_per_endpoint"), "must be > 0"));
        }

        let timeouts = [
            ("borrow_timeout_ms", pool.borrow_timeout_ms),
            ("connect_timeout_ms", pool.connect_timeout_ms),
            ("idle_timeout_ms", pool.idle_timeout_ms),
            ("max_lifetime_ms", pool.max_lifetime_ms),
            ("dispose_timeout_ms", pool.dispose_timeout_ms),
            ("keep_alive.idle_secs", pool.keep_alive.idle_secs),
            ("keep_alive.interval_secs", pool.keep_alive.interval_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                errors.push(ValidationError::new(field(name), "must be > 0"));
            }
        }
    }

    if defaults > 1 {
        errors.push(ValidationError::new("pools", "more than one '*' pool"));
    }
}

/// Returns the names of the backend groups that have at least one endpoint.
fn validate_backends(config: &ProxyConfig, errors: &mut Vec<ValidationError>) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut groups = HashSet::new();

    for (i, backend) in config.backends.iter().enumerate() {
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::new(
                format!("backends[{i}].name"),
                format!("duplicate backend '{}'", backend.name),
            ));
        }
        match backend.address.parse::<EndpointKey>() {
            Ok(_) => {
                groups.insert(backend.group.clone());
            }
            Err(e) => errors.push(ValidationError::new(format!("backends[{i}].address"), e.to_string())),
        }
    }
    groups
}

fn validate_routing(
    config: &ProxyConfig,
    mappers: &MapperRegistry,
    groups: &HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    let routing = &config.routing;
    if !mappers.contains(&routing.mapper) {
        let known: Vec<&str> = mappers.ids().collect();
        errors.push(ValidationError::new(
            "routing.mapper",
            format!("unknown mapper '{}' (known: {})", routing.mapper, known.join(", ")),
        ));
    }
    if routing.mapper == "fixed" {
        match &routing.fixed_group {
            None => errors.push(ValidationError::new("routing.fixed_group", "required by the fixed mapper")),
            Some(group) if !groups.contains(group) => errors.push(ValidationError::new(
                "routing.fixed_group",
                format!("unknown backend group '{group}'"),
            )),
            Some(_) => {}
        }
    }
}

fn validate_routes(config: &ProxyConfig, groups: &HashSet<String>, errors: &mut Vec<ValidationError>) {
    let mut names = HashSet::new();

    for (i, route) in config.routes.iter().enumerate() {
        let field = |name: &str| format!("routes[{i}].{name}");

        if !names.insert(route.name.as_str()) {
            errors.push(ValidationError::new(field("name"), format!("duplicate route '{}'", route.name)));
        }

        match (&route.backend_group, route.action) {
            (Some(group), _) if !groups.contains(group) => errors.push(ValidationError::new(
                field("backend_group"),
                format!("unknown backend group '{group}'"),
            )),
            (None, RouteAction::Proxy | RouteAction::ProxyAndCache) => {
                errors.push(ValidationError::new(field("backend_group"), "required for proxy actions"))
            }
            _ => {}
        }

        if route.action == RouteAction::Static && route.resource.is_none() {
            errors.push(ValidationError::new(field("resource"), "required for static routes"));
        }

        if let Some(redirect) = &route.redirect {
            validate_redirect(redirect, &field("redirect"), errors);
        }

        if compile_mutations(&route.headers).is_none() {
            errors.push(ValidationError::new(field("headers"), "invalid header name or value"));
        }
        for (name, page) in [
            ("not_found_page", &route.not_found_page),
            ("internal_error_page", &route.internal_error_page),
        ] {
            if let Some(page) = page {
                validate_page(page, &field(name), errors);
            }
        }
    }
}

fn validate_redirect(redirect: &RedirectConfig, field: &str, errors: &mut Vec<ValidationError>) {
    if let Some(location) = &redirect.location {
        if let Err(e) = url::Url::parse(location) {
            errors.push(ValidationError::new(
                format!("{field}.location"),
                format!("'{location}' is not an absolute URL: {e}"),
            ));
        }
    }
    let scheme = redirect.scheme.trim();
    if !scheme.is_empty() && !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        errors.push(ValidationError::new(
            format!("{field}.scheme"),
            format!("'{scheme}' is not http or https"),
        ));
    }
    if let Some(status) = redirect.status {
        if !(300..400).contains(&status) {
            errors.push(ValidationError::new(
                format!("{field}.status"),
                format!("{status} is not a redirect status"),
            ));
        }
    }
}

fn validate_page(page: &PageConfig, field: &str, errors: &mut Vec<ValidationError>) {
    if !(100..600).contains(&page.status) {
        errors.push(ValidationError::new(
            format!("{field}.status"),
            format!("{} is not an HTTP status", page.status),
        ));
    }
    if page.resource.trim().is_empty() {
        errors.push(ValidationError::new(format!("{field}.resource"), "must not be empty"));
    }
}

fn validate_pages(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    if let Some(page) = &config.pages.not_found {
        validate_page(page, "pages.not_found", errors);
    }
    if let Some(page) = &config.pages.internal_error {
        validate_page(page, "pages.internal_error", errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackendConfig, RouteConfig};

    fn backend(name: &str, group: &str, address: &str) -> BackendConfig {
        BackendConfig {
            name: name.into(),
            group: group.into(),
            address: address.into(),
        }
    }

    fn route(name: &str, action: RouteAction, group: Option<&str>) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            host: None,
            path_prefix: Some("/".into()),
            priority: 0,
            action,
            backend_group: group.map(String::from),
            resource: None,
            redirect: None,
            headers: Vec::new(),
            not_found_page: None,
            internal_error_page: None,
        }
    }

    fn fields(errors: &[ValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn request_timeout_must_outlast_forwarder_timeouts() {
        let mut config = ProxyConfig::default();
        config.forwarding.request_timeout_secs = 1;
        config.forwarding.stuck_timeout_ms = 10_000;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["forwarding.request_timeout_secs"]);

        // 5s default borrow + 30s stuck leaves exactly 35s: still too short.
        config.forwarding.stuck_timeout_ms = 30_000;
        config.forwarding.request_timeout_secs = 35;
        assert!(validate_config(&config).is_err());

        config.pools = vec![PoolConfig {
            borrow_timeout_ms: 1_000,
            ..PoolConfig::default()
        }];
        config.forwarding.request_timeout_secs = 32;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ProxyConfig::default();
        config.cache.max_file_size_bytes = config.cache.max_size_bytes + 1;
        config.pools = vec![
            PoolConfig::default(),
            PoolConfig {
                id: "default".into(),
                borrow_timeout_ms: 0,
                ..PoolConfig::default()
            },
        ];
        config.backends = vec![backend("a", "web", "10.0.0.1:70000")];
        config.routes = vec![route("site", RouteAction::ProxyAndCache, Some("web"))];
        config.routing.mapper = "regex".into();

        let errors = validate_config(&config).unwrap_err();
        let fields = fields(&errors);
        assert!(fields.contains(&"cache.max_file_size_bytes"));
        assert!(fields.contains(&"pools[1].id"));
        assert!(fields.contains(&"pools[1].borrow_timeout_ms"));
        assert!(fields.contains(&"pools"));
        assert!(fields.contains(&"backends[0].address"));
        assert!(fields.contains(&"routes[0].backend_group"));
        assert!(fields.contains(&"routing.mapper"));
    }

    #[test]
    fn redirect_location_must_be_absolute() {
        let mut config = ProxyConfig::default();
        let mut r = route("moved", RouteAction::Redirect, None);
        r.redirect = Some(RedirectConfig {
            location: Some("/relative".into()),
            status: Some(200),
            ..Default::default()
        });
        config.routes = vec![r];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["routes[0].redirect.location", "routes[0].redirect.status"]);
    }

    #[test]
    fn fixed_mapper_needs_known_group() {
        let mut config = ProxyConfig::default();
        config.routing.mapper = "fixed".into();
        assert_eq!(fields(&validate_config(&config).unwrap_err()), vec!["routing.fixed_group"]);

        config.backends = vec![backend("a", "web", "127.0.0.1:3000")];
        config.routing.fixed_group = Some("web".into());
        assert!(validate_config(&config).is_ok());
    }
}
