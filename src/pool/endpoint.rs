//! Backend endpoint identity and per-endpoint counters.
//!
//! # Responsibilities
//! - Represent a backend as a validated (host, port) pair
//! - Track requests issued and last activity per backend
//!
//! # Design Decisions
//! - Hosts are lowercased so the key is case-insensitive
//! - Counters are plain atomics; only the forwarder writes them

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::clock;

/// Errors raised while building an [`EndpointKey`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint host must not be blank")]
    BlankHost,

    #[error("endpoint port {0} is outside 0..=65535")]
    PortOutOfRange(i64),

    #[error("endpoint '{0}' is not in host:port form")]
    Malformed(String),
}

/// A backend address. Immutable, usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    host: String,
    port: u16,
}

impl EndpointKey {
    /// Build a key, rejecting blank hosts and ports outside the u16 range.
    pub fn new(host: impl AsRef<str>, port: i64) -> Result<Self, EndpointError> {
        let host = host.as_ref().trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(EndpointError::BlankHost);
        }
        let port = u16::try_from(port).map_err(|_| EndpointError::PortOutOfRange(port))?;
        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` suitable for a URI authority (IPv6 hosts are bracketed).
    pub fn authority(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for EndpointKey {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s
            .strip_prefix("http://")
            .unwrap_or(s)
            .trim_end_matches('/');
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::Malformed(s.to_string()))?;
        let port: i64 = port
            .parse()
            .map_err(|_| EndpointError::Malformed(s.to_string()))?;
        Self::new(host, port)
    }
}

/// Per-backend counters updated on every forward attempt.
#[derive(Debug, Default)]
pub struct EndpointStats {
    total_requests: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl EndpointStats {
    /// Count a forward attempt and mark the endpoint active.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Mark activity (a chunk moved) without counting a request.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(clock::now_millis(), Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Millis since epoch of the last activity, 0 if never used.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_host_and_port() {
        assert_eq!(EndpointKey::new("  ", 80), Err(EndpointError::BlankHost));
        assert_eq!(
            EndpointKey::new("a", 65536),
            Err(EndpointError::PortOutOfRange(65536))
        );
        assert_eq!(
            EndpointKey::new("a", -1),
            Err(EndpointError::PortOutOfRange(-1))
        );
        assert!(EndpointKey::new("a", 0).is_ok());
        assert!(EndpointKey::new("a", 65535).is_ok());
    }

    #[test]
    fn parses_host_port_forms() {
        let key: EndpointKey = "Backend.Local:8080".parse().unwrap();
        assert_eq!(key.host(), "backend.local");
        assert_eq!(key.port(), 8080);

        let v6: EndpointKey = "[::1]:9000".parse().unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:9000");

        assert!("no-port".parse::<EndpointKey>().is_err());
    }

    #[test]
    fn stats_count_and_touch() {
        let stats = EndpointStats::default();
        assert_eq!(stats.last_activity_ms(), 0);
        stats.record_request();
        stats.record_request();
        assert_eq!(stats.total_requests(), 2);
        assert!(stats.last_activity_ms() > 0);
    }
}
