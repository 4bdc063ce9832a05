//! Redirect `Location` composition.

use crate::routing::RedirectTarget;

/// Split `host[:port]`, understanding bracketed IPv6 literals.
fn split_host_port(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, port.parse().ok()),
        _ => (authority, None),
    }
}

/// Build the `Location` for a redirect.
///
/// An explicit location wins. Otherwise the target's scheme is forced onto
/// the target host (or the request host) and the request path and query;
/// the port is written only when it differs from the scheme's default.
pub fn compose_location(target: &RedirectTarget, request_host: &str, path_and_query: &str) -> String {
    if let Some(location) = target.location.as_deref().filter(|l| !l.is_empty()) {
        return location.to_string();
    }

    let (request_host, _) = split_host_port(request_host);
    let host = target.host.as_deref().unwrap_or(request_host);
    let scheme = target.scheme;

    let mut location = format!("{}://", scheme.as_str());
    if host.contains(':') {
        location.push('[');
        location.push_str(host);
        location.push(']');
    } else {
        location.push_str(host);
    }
    if let Some(port) = target.port.filter(|p| !scheme.is_default_port(*p)) {
        location.push(':');
        location.push_str(&port.to_string());
    }
    if !path_and_query.starts_with('/') {
        location.push('/');
    }
    location.push_str(path_and_query);
    location
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RedirectScheme;

    #[test]
    fn explicit_location_wins() {
        let target = RedirectTarget {
            location: Some("https://elsewhere.test/x".into()),
            ..Default::default()
        };
        assert_eq!(compose_location(&target, "site.test", "/a"), "https://elsewhere.test/x");
    }

    #[test]
    fn forces_scheme_and_drops_request_port() {
        let target = RedirectTarget {
            scheme: RedirectScheme::Https,
            ..Default::default()
        };
        assert_eq!(
            compose_location(&target, "Site.test:8080", "/a?b=c"),
            "https://Site.test/a?b=c"
        );
    }

    #[test]
    fn explicit_host_and_port() {
        let target = RedirectTarget {
            scheme: RedirectScheme::Http,
            host: Some("www.site.test".into()),
            port: Some(8080),
            ..Default::default()
        };
        assert_eq!(compose_location(&target, "site.test", "/"), "http://www.site.test:8080/");

        let default_port = RedirectTarget {
            scheme: RedirectScheme::Https,
            port: Some(443),
            ..Default::default()
        };
        assert_eq!(compose_location(&default_port, "[::1]:80", "/p"), "https://[::1]/p");
    }
}
