//! The forwarding engine: one request out, one streamed response back.
//!
//! # Responsibilities
//! - Resolve the pool for the request's host and lease an endpoint slot
//! - Rewrite the request for the backend and send it
//! - Stream the response body to the client, feeding the cache behind it
//! - Classify failures and report unreachable backends
//!
//! # Design Decisions
//! - The response is returned as soon as its head arrives; a spawned pump
//!   task owns the context, the lease and the capture until the body ends
//! - Each chunk goes to the client before it goes to the capture
//! - A failure after the head was returned aborts the client body stream
//!   instead of writing a second status

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, Version};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::sync::mpsc;

use crate::cache::{is_hop_by_hop_header, strip_validators, CacheKey, CacheWriteHandle, ContentCache};
use crate::clock;
use crate::config::schema::ForwardingConfig;
use crate::forward::error::ForwardError;
use crate::health::FailureReporter;
use crate::http::context::RequestContext;
use crate::observability::metrics;
use crate::pool::{EndpointKey, EndpointStats, Lease, PoolError, PoolRegistry};

/// Chunks buffered between the backend reader and the client writer.
const BODY_CHANNEL_DEPTH: usize = 8;

type ChunkResult = Result<Bytes, io::Error>;

/// Forwarding knobs fixed at startup.
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    /// Longest silence tolerated from a backend, head or body.
    pub stuck_timeout: Duration,
    pub mark_stuck_unreachable: bool,
}

impl From<&ForwardingConfig> for ForwardSettings {
    fn from(config: &ForwardingConfig) -> Self {
        Self {
            stuck_timeout: config.stuck_timeout(),
            mark_stuck_unreachable: config.mark_stuck_unreachable,
        }
    }
}

/// What `forward` produced.
pub enum ForwardOutcome {
    /// Backend head received; the body streams on its own task.
    Streaming(Response<Body>),
    /// Nothing was sent to the client. The caller renders the fallback page.
    Failed(RequestContext, ForwardError),
}

/// Counts a forward from start until its last byte (or failure).
struct PendingForward(Arc<AtomicUsize>);

impl PendingForward {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        let pending = counter.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::record_pending_forwards(pending);
        Self(counter.clone())
    }
}

impl Drop for PendingForward {
    fn drop(&mut self) {
        let pending = self.0.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::record_pending_forwards(pending);
    }
}

pub struct Forwarder {
    pools: Arc<PoolRegistry>,
    cache: Arc<ContentCache>,
    reporter: Arc<dyn FailureReporter>,
    settings: ForwardSettings,
    stats: DashMap<EndpointKey, Arc<EndpointStats>>,
    pending: Arc<AtomicUsize>,
    stuck: AtomicU64,
}

impl Forwarder {
    pub fn new(
        pools: Arc<PoolRegistry>,
        cache: Arc<ContentCache>,
        reporter: Arc<dyn FailureReporter>,
        settings: ForwardSettings,
    ) -> Self {
        Self {
            pools,
            cache,
            reporter,
            settings,
            stats: DashMap::new(),
            pending: Arc::new(AtomicUsize::new(0)),
            stuck: AtomicU64::new(0),
        }
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn settings(&self) -> &ForwardSettings {
        &self.settings
    }

    pub fn endpoint_stats(&self, endpoint: &EndpointKey) -> Option<Arc<EndpointStats>> {
        self.stats.get(endpoint).map(|s| s.clone())
    }

    /// Requests that hit the stuck timeout since startup.
    pub fn stuck_requests(&self) -> u64 {
        self.stuck.load(Ordering::Relaxed)
    }

    /// Forwards started and not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn stats_for(&self, endpoint: &EndpointKey) -> Arc<EndpointStats> {
        if let Some(existing) = self.stats.get(endpoint) {
            return existing.clone();
        }
        self.stats.entry(endpoint.clone()).or_default().clone()
    }

    /// Forward `request` to the backend named by the context's decision.
    pub async fn forward(
        self: &Arc<Self>,
        mut ctx: RequestContext,
        request: Request<Body>,
        cache_enabled: bool,
    ) -> ForwardOutcome {
        let Some(endpoint) = ctx.decision().target.clone() else {
            let err = ForwardError::InvalidTarget(format!(
                "route '{}' has no backend",
                ctx.decision().route_id
            ));
            return self.fail(ctx, err, None).await;
        };

        let pending = PendingForward::start(&self.pending);
        let stats = self.stats_for(&endpoint);
        stats.record_request();

        let (mut parts, body) = request.into_parts();
        let mut capture = if cache_enabled {
            let key = CacheKey::from_parts(&parts.method, &parts.uri, &parts.headers, ctx.is_secure());
            self.cache.begin_capture(key, &parts.headers)
        } else {
            None
        };
        if capture.is_some() {
            strip_validators(&mut parts.headers);
        }

        if let Err(err) = rewrite_for_backend(&mut parts, &endpoint, ctx.host()) {
            return self.fail(ctx, err, capture).await;
        }

        let lease = match self.pools.resolve(ctx.host()).lease(&endpoint).await {
            // Raced a reload; the registry already holds the replacement.
            Err(PoolError::Closed(_)) => self.pools.resolve(ctx.host()).lease(&endpoint).await,
            other => other,
        };
        let mut lease = match lease {
            Ok(lease) => lease,
            Err(e) => return self.fail(ctx, e.into(), capture).await,
        };

        tracing::debug!(
            request_id = ctx.id(),
            endpoint = %endpoint,
            pool = lease.pool_id(),
            capture = capture.is_some(),
            "Forwarding request"
        );

        ctx.mark_backend_start();
        let pool_id = lease.pool_id().to_string();
        let stuck_after = self.settings.stuck_timeout;
        let send = lease.client().request(Request::from_parts(parts, body));
        let result = tokio::select! {
            sent = tokio::time::timeout(stuck_after, send) => match sent {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(classify_client_error(&endpoint, &e)),
                Err(_) => Err(ForwardError::Stuck { endpoint: endpoint.clone(), after: stuck_after }),
            },
            _ = lease.force_closed() => Err(ForwardError::PoolClosed(pool_id)),
        };
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                drop(lease);
                return self.fail(ctx, err, capture).await;
            }
        };

        let (mut head, backend_body) = response.into_parts();
        strip_hop_by_hop(&mut head.headers);

        if let Some(handle) = capture.as_mut() {
            if handle.on_response_headers(head.status, &head.headers) {
                if let Some(expires) = handle.synthesized_expires() {
                    head.headers.insert(header::EXPIRES, expires.clone());
                }
            } else {
                tracing::debug!(
                    request_id = ctx.id(),
                    key = %handle.key(),
                    reason = ?handle.rejection(),
                    "Response not cacheable"
                );
            }
        }
        let capture = match capture {
            Some(handle) if !handle.is_active() => {
                self.cache.abort(handle).await;
                None
            }
            other => other,
        };

        ctx.set_status(head.status);
        ctx.mark_headers_sent();

        let (tx, rx) = mpsc::channel::<ChunkResult>(BODY_CHANNEL_DEPTH);
        let client_body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        }));

        let pump = BodyPump {
            forwarder: self.clone(),
            ctx,
            body: backend_body,
            tx,
            capture,
            lease,
            stats,
            _pending: pending,
        };
        tokio::spawn(pump.run());

        ForwardOutcome::Streaming(Response::from_parts(head, client_body))
    }

    async fn fail(
        &self,
        ctx: RequestContext,
        err: ForwardError,
        capture: Option<CacheWriteHandle>,
    ) -> ForwardOutcome {
        if let Some(handle) = capture {
            self.cache.abort(handle).await;
        }
        self.note_failure(ctx.id(), &err);
        ForwardOutcome::Failed(ctx, err)
    }

    /// Count, log and report a failure. Never fails itself.
    fn note_failure(&self, request_id: u64, err: &ForwardError) {
        match err {
            ForwardError::Stuck { endpoint, after } => {
                self.stuck.fetch_add(1, Ordering::Relaxed);
                metrics::record_stuck_request(&endpoint.to_string());
                tracing::warn!(
                    request_id,
                    endpoint = %endpoint,
                    after_ms = after.as_millis() as u64,
                    "Backend request stuck"
                );
            }
            ForwardError::Connect { endpoint, reason } => {
                tracing::warn!(request_id, endpoint = %endpoint, reason = %reason, "Backend connect failed");
            }
            ForwardError::PoolExhausted { endpoint, waited } => {
                tracing::warn!(
                    request_id,
                    endpoint = %endpoint,
                    waited_ms = waited.as_millis() as u64,
                    "Connection pool exhausted"
                );
            }
            ForwardError::ClientGone => {
                tracing::debug!(request_id, "Client went away mid-response");
            }
            other => {
                tracing::error!(
                    request_id,
                    endpoint = ?other.endpoint(),
                    error = %other,
                    "Forwarding failed"
                );
            }
        }

        if err.reports_unreachable(self.settings.mark_stuck_unreachable) {
            if let Some(endpoint) = err.endpoint() {
                self.reporter
                    .report_unreachable(endpoint, clock::now_millis(), &err.to_string());
            }
        }
    }
}

/// Owns everything a streamed response needs until its last chunk.
struct BodyPump {
    forwarder: Arc<Forwarder>,
    ctx: RequestContext,
    body: Incoming,
    tx: mpsc::Sender<ChunkResult>,
    capture: Option<CacheWriteHandle>,
    lease: Lease,
    stats: Arc<EndpointStats>,
    _pending: PendingForward,
}

impl BodyPump {
    async fn run(mut self) {
        let endpoint = self.lease.endpoint().clone();
        let pool_id = self.lease.pool_id().to_string();
        let stuck_after = self.forwarder.settings.stuck_timeout;

        let result = loop {
            tokio::select! {
                frame = tokio::time::timeout(stuck_after, self.body.frame()) => {
                    let frame = match frame {
                        Err(_) => break Err(ForwardError::Stuck { endpoint: endpoint.clone(), after: stuck_after }),
                        Ok(None) => break Ok(()),
                        Ok(Some(Err(e))) => {
                            break Err(ForwardError::Upstream { endpoint: endpoint.clone(), reason: e.to_string() })
                        }
                        Ok(Some(Ok(frame))) => frame,
                    };
                    // Trailers are not relayed.
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    self.stats.touch();
                    self.ctx.touch();
                    if self.tx.send(Ok(data.clone())).await.is_err() {
                        break Err(ForwardError::ClientGone);
                    }
                    if let Some(handle) = self.capture.as_mut() {
                        handle.on_body_chunk(&data);
                    }
                }
                _ = self.tx.closed() => break Err(ForwardError::ClientGone),
                _ = self.lease.force_closed() => break Err(ForwardError::PoolClosed(pool_id.clone())),
            }
        };

        self.ctx.mark_backend_done();
        let forwarder = self.forwarder.clone();
        match result {
            Ok(()) => {
                if let Some(handle) = self.capture.take() {
                    if handle.is_active() {
                        forwarder.cache.commit(handle).await;
                    } else {
                        forwarder.cache.abort(handle).await;
                    }
                }
                forwarder.reporter.report_success(&endpoint);
            }
            Err(err) => {
                if let Some(handle) = self.capture.take() {
                    forwarder.cache.abort(handle).await;
                }
                // Headers are out; the only signal left is a broken body.
                debug_assert!(self.ctx.headers_sent());
                if !matches!(err, ForwardError::ClientGone) {
                    let abort = Err(io::Error::other(err.to_string()));
                    let _ = tokio::time::timeout(stuck_after, self.tx.send(abort)).await;
                }
                forwarder.note_failure(self.ctx.id(), &err);
            }
        }
    }
}

/// Point the request at `endpoint`, keeping the client's `Host`.
fn rewrite_for_backend(parts: &mut Parts, endpoint: &EndpointKey, client_host: &str) -> Result<(), ForwardError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = Uri::builder()
        .scheme("http")
        .authority(endpoint.authority())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ForwardError::InvalidTarget(e.to_string()))?;

    if !client_host.is_empty() {
        let host = HeaderValue::from_str(client_host)
            .map_err(|e| ForwardError::InvalidTarget(format!("host header: {e}")))?;
        parts.headers.insert(header::HOST, host);
    }
    parts.version = Version::HTTP_11;
    Ok(())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(&name);
    }
}

fn classify_client_error(endpoint: &EndpointKey, e: &hyper_util::client::legacy::Error) -> ForwardError {
    let reason = match std::error::Error::source(e) {
        Some(source) => format!("{e}: {source}"),
        None => e.to_string(),
    };
    if e.is_connect() {
        ForwardError::Connect { endpoint: endpoint.clone(), reason }
    } else {
        ForwardError::Upstream { endpoint: endpoint.clone(), reason }
    }
}
