//! Per-request state.
//!
//! # Responsibilities
//! - Assign the monotonic request id and the start timestamps
//! - Carry the routing decision and the outcome through the task chain
//! - Emit the access record exactly once, when the context is dropped
//!
//! # Design Decisions
//! - One owner at a time: the handler, then the body pump for streamed responses
//! - Derived fields (normalized path, query pairs) are computed on first use
//! - Dropping the context is the only way a request finishes

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::extract::connect_info::Connected;
use axum::http::{header, request::Parts, HeaderMap, Method, StatusCode, Uri, Version};
use axum::serve::IncomingStream;
use tokio::net::TcpListener;

use crate::clock;
use crate::observability::access::{AccessLogSink, AccessRecord};
use crate::observability::metrics;
use crate::routing::{Action, RequestView, RoutingDecision};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Status logged for requests that ended without a response (499).
pub fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Negotiated TLS parameters of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol: String,
    pub cipher: String,
}

/// Transport facts about the connection a request arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Set when a terminating layer in front of the server negotiated TLS.
    pub tls: Option<TlsInfo>,
}

impl ConnectionInfo {
    pub fn plain(peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            peer,
            local,
            tls: None,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

impl Connected<IncomingStream<'_, TcpListener>> for ConnectionInfo {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        let peer = *stream.remote_addr();
        let local = stream.io().local_addr().unwrap_or(peer);
        Self::plain(peer, local)
    }
}

/// Request fields the pipeline keeps after the request itself is handed off.
#[derive(Debug, Clone)]
struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    host: String,
    keep_alive: bool,
}

impl RequestHead {
    fn from_parts(parts: &Parts) -> Self {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| parts.uri.authority().map(|a| a.as_str()))
            .unwrap_or_default()
            .to_string();
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            host,
            keep_alive: wants_keep_alive(parts.version, &parts.headers),
        }
    }
}

fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let has = |token: &str| {
        connection
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    match version {
        Version::HTTP_09 => false,
        Version::HTTP_10 => has("keep-alive"),
        _ => !has("close"),
    }
}

/// Collapse duplicate slashes and resolve `.` and `..` segments.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut normalized = String::with_capacity(path.len());
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() || (path.ends_with('/') && !segments.is_empty()) {
        normalized.push('/');
    }
    normalized
}

/// Mutable state of one request.
pub struct RequestContext {
    id: u64,
    started: Instant,
    start_ms: u64,
    last_activity: Instant,
    backend_started: Option<Instant>,
    backend_elapsed: Duration,
    connection: ConnectionInfo,
    head: RequestHead,
    decision: Arc<RoutingDecision>,
    status: StatusCode,
    from_cache: bool,
    headers_sent: bool,
    normalized_path: OnceLock<String>,
    query: OnceLock<Vec<(String, String)>>,
    access_log: Option<Arc<dyn AccessLogSink>>,
}

impl RequestContext {
    /// Start tracking a request whose head has just been read.
    pub fn new(
        connection: ConnectionInfo,
        parts: &Parts,
        decision: Arc<RoutingDecision>,
        access_log: Option<Arc<dyn AccessLogSink>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            started: now,
            start_ms: clock::now_millis(),
            last_activity: now,
            backend_started: None,
            backend_elapsed: Duration::ZERO,
            connection,
            head: RequestHead::from_parts(parts),
            decision,
            status: StatusCode::OK,
            from_cache: false,
            headers_sent: false,
            normalized_path: OnceLock::new(),
            query: OnceLock::new(),
            access_log,
        }
    }

    /// View handed to a mapper before the context exists.
    pub fn view<'a>(parts: &'a Parts, connection: &ConnectionInfo) -> RequestView<'a> {
        RequestView {
            method: &parts.method,
            uri: &parts.uri,
            headers: &parts.headers,
            peer: connection.peer,
            secure: connection.is_secure(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn is_secure(&self) -> bool {
        self.connection.is_secure()
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Host as the client sent it, port included.
    pub fn host(&self) -> &str {
        &self.head.host
    }

    pub fn keep_alive(&self) -> bool {
        self.head.keep_alive
    }

    pub fn decision(&self) -> &RoutingDecision {
        &self.decision
    }

    pub fn action(&self) -> Action {
        self.decision.action
    }

    pub fn path(&self) -> &str {
        self.normalized_path
            .get_or_init(|| normalize_path(self.head.uri.path()))
    }

    pub fn query(&self) -> &[(String, String)] {
        self.query.get_or_init(|| {
            self.head
                .uri
                .query()
                .map(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn mark_from_cache(&mut self) {
        self.from_cache = true;
    }

    /// Whether a status line has gone to the client.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn mark_backend_start(&mut self) {
        let now = Instant::now();
        self.backend_started = Some(now);
        self.last_activity = now;
    }

    /// Close the backend timer. Later calls are ignored.
    pub fn mark_backend_done(&mut self) {
        if let Some(started) = self.backend_started.take() {
            self.backend_elapsed = started.elapsed();
        }
    }

    pub fn backend_elapsed(&self) -> Duration {
        match self.backend_started {
            Some(started) => started.elapsed(),
            None => self.backend_elapsed,
        }
    }

    /// Snapshot for the access log.
    pub fn record(&self) -> AccessRecord {
        AccessRecord {
            request_id: self.id,
            client_addr: self.connection.peer,
            local_addr: self.connection.local,
            method: self.head.method.to_string(),
            host: self.head.host.clone(),
            uri: self.head.uri.to_string(),
            status: self.status.as_u16(),
            start_ms: self.start_ms,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            backend_elapsed_ms: if self.from_cache {
                0
            } else {
                self.backend_elapsed().as_millis() as u64
            },
            action: self.decision.action.id(),
            route_id: self.decision.route_id.clone(),
            user_id: self.decision.user_id.clone(),
            session_id: self.decision.session_id.clone(),
            tls_protocol: self.connection.tls.as_ref().map(|t| t.protocol.clone()),
            tls_cipher: self.connection.tls.as_ref().map(|t| t.cipher.clone()),
            from_cache: self.from_cache,
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        // Dropped before any response head: the request future was cancelled
        // (client gone or outer timeout), so nothing with `status` was sent.
        if !self.headers_sent {
            self.status = client_closed_request();
        }
        self.mark_backend_done();
        metrics::record_request(self.decision.action.id(), self.status.as_u16(), self.started);
        if let Some(sink) = self.access_log.take() {
            sink.log(&self.record());
        }
    }
}
