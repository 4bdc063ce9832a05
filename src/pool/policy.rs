//! Pool policies and destination-domain matching.

use std::time::Duration;

use crate::config::schema::{PoolConfig, DEFAULT_POOL_DOMAIN};

/// Destination-domain pattern of a pool policy.
///
/// Matching is case-insensitive and ignores any `:port` suffix on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    /// `*`: matches every host.
    Any,
    /// `*.example.com`: matches `example.com` and any subdomain of it.
    Suffix(String),
    /// Exact host.
    Exact(String),
}

impl DomainPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == DEFAULT_POOL_DOMAIN {
            DomainPattern::Any
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            DomainPattern::Suffix(suffix.to_string())
        } else {
            DomainPattern::Exact(pattern)
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = strip_port(host).to_ascii_lowercase();
        match self {
            DomainPattern::Any => true,
            DomainPattern::Exact(exact) => host == *exact,
            DomainPattern::Suffix(suffix) => {
                host == *suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
        }
    }
}

fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if host.starts_with('[') {
        // [v6]:port
        return host.split_once(']').map(|(h, _)| &h[1..]).unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Immutable runtime form of a pool configuration.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    pub id: String,
    pub pattern: DomainPattern,
    pub max_connections_per_endpoint: usize,
    pub borrow_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub dispose_timeout: Duration,
    pub keep_alive_idle: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_count: u32,
    pub enabled: bool,
}

impl PoolPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            id: config.id.clone(),
            pattern: DomainPattern::parse(&config.domain),
            max_connections_per_endpoint: config.max_connections_per_endpoint.max(1),
            borrow_timeout: Duration::from_millis(config.borrow_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            max_lifetime: Duration::from_millis(config.max_lifetime_ms),
            dispose_timeout: Duration::from_millis(config.dispose_timeout_ms),
            keep_alive_idle: Duration::from_secs(config.keep_alive.idle_secs),
            keep_alive_interval: Duration::from_secs(config.keep_alive.interval_secs),
            keep_alive_count: config.keep_alive.count,
            enabled: config.enabled,
        }
    }

    pub fn is_default(&self) -> bool {
        self.pattern == DomainPattern::Any
    }

    pub fn matches(&self, host: &str) -> bool {
        self.pattern.matches(host)
    }
}
