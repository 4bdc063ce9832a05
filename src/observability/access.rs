//! Access log records.
//!
//! # Responsibilities
//! - Define the snapshot handed over when a request finishes
//! - Emit it through `tracing` on the `access` target
//!
//! # Design Decisions
//! - The sink is a trait so formatting/rotation can live elsewhere
//! - Records are owned copies; nothing references live request state

use std::net::SocketAddr;

use serde::Serialize;

use crate::config::schema::AccessLogFormat;

/// Read-only snapshot of a finished request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccessRecord {
    pub request_id: u64,
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub method: String,
    pub host: String,
    pub uri: String,
    pub status: u16,
    /// Millis since epoch when the request head completed.
    pub start_ms: u64,
    pub elapsed_ms: u64,
    /// Time spent waiting on the backend; 0 when not forwarded.
    pub backend_elapsed_ms: u64,
    pub action: &'static str,
    pub route_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tls_protocol: Option<String>,
    pub tls_cipher: Option<String>,
    pub from_cache: bool,
}

/// Receives exactly one record per request.
pub trait AccessLogSink: Send + Sync {
    fn log(&self, record: &AccessRecord);
}

/// Sink that drops records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAccessLog;

impl AccessLogSink for NullAccessLog {
    fn log(&self, _record: &AccessRecord) {}
}

/// Emits records as `tracing` events on the `access` target.
#[derive(Debug, Clone, Copy)]
pub struct TracingAccessLog {
    format: AccessLogFormat,
}

impl TracingAccessLog {
    pub fn new(format: AccessLogFormat) -> Self {
        Self { format }
    }
}

impl AccessLogSink for TracingAccessLog {
    fn log(&self, r: &AccessRecord) {
        match self.format {
            AccessLogFormat::Fields => tracing::info!(
                target: "access",
                request_id = r.request_id,
                client = %r.client_addr,
                local = %r.local_addr,
                method = %r.method,
                host = %r.host,
                uri = %r.uri,
                status = r.status,
                start_ms = r.start_ms,
                elapsed_ms = r.elapsed_ms,
                backend_ms = r.backend_elapsed_ms,
                action = r.action,
                route = %r.route_id,
                user = r.user_id.as_deref().unwrap_or("-"),
                session = r.session_id.as_deref().unwrap_or("-"),
                tls = r.tls_protocol.as_deref().unwrap_or("-"),
                cipher = r.tls_cipher.as_deref().unwrap_or("-"),
                cached = r.from_cache,
            ),
            AccessLogFormat::Json => match serde_json::to_string(r) {
                Ok(line) => tracing::info!(target: "access", "{line}"),
                Err(e) => tracing::warn!(error = %e, "Failed to encode access record"),
            },
        }
    }
}
