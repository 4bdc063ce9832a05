//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use edge_proxy::config::schema::{BackendConfig, RouteAction, RouteConfig};
use edge_proxy::health::FailureReporter;
use edge_proxy::http::{Collaborators, HttpServer, Reloader};
use edge_proxy::pipeline::Pipeline;
use edge_proxy::pool::EndpointKey;
use edge_proxy::{ProxyConfig, Shutdown};

/// What a mock backend answers with.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl MockResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A raw-socket HTTP/1.1 backend bound to an ephemeral port.
pub struct MockBackend {
    pub addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    /// Always answer with `response`.
    pub async fn start(response: MockResponse) -> Self {
        Self::start_with(move |_, _| response.clone()).await
    }

    /// Answer the n-th request (0-based) with `f(n, request_head)`.
    pub async fn start_with<F>(f: F) -> Self
    where
        F: Fn(usize, &str) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::new(f);

        let (c, r) = (calls.clone(), requests.clone());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let (f, calls, requests) = (f.clone(), c.clone(), r.clone());
                tokio::spawn(async move {
                    let Some(head) = read_head(&mut socket).await else {
                        return;
                    };
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    requests.lock().unwrap().push(head.clone());
                    let response = f(n, &head);
                    if !response.delay.is_zero() {
                        tokio::time::sleep(response.delay).await;
                    }
                    let _ = socket.write_all(&encode(&response)).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            addr,
            calls,
            requests,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<String> {
        self.requests.lock().unwrap().last().cloned()
    }
}

async fn read_head(socket: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let body_len = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    // Drain the request body so closing the socket does not reset it.
    let mut remaining = body_len.saturating_sub(buf.len() - head_end);
    while remaining > 0 {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        remaining = remaining.saturating_sub(n);
    }
    Some(head)
}

fn encode(response: &MockResponse) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} Mock\r\n", response.status);
    let mut has_length = false;
    for (name, value) in &response.headers {
        has_length |= name.eq_ignore_ascii_case("content-length");
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if !has_length {
        out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    out.push_str("Connection: close\r\n\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&response.body);
    bytes
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Reporter that remembers every signal.
#[derive(Default)]
pub struct RecordingReporter {
    unreachable: Mutex<Vec<(EndpointKey, String)>>,
    successes: AtomicUsize,
}

impl RecordingReporter {
    pub fn unreachable(&self) -> Vec<(EndpointKey, String)> {
        self.unreachable.lock().unwrap().clone()
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }
}

impl FailureReporter for RecordingReporter {
    fn report_unreachable(&self, endpoint: &EndpointKey, _timestamp_ms: u64, reason: &str) {
        self.unreachable
            .lock()
            .unwrap()
            .push((endpoint.clone(), reason.to_string()));
    }

    fn report_success(&self, _endpoint: &EndpointKey) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }
}

/// One route sending every request to `backend` with `action`.
pub fn proxy_config(backend: SocketAddr, action: RouteAction) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.observability.metrics_enabled = false;
    config.backends = vec![BackendConfig {
        name: "backend-1".into(),
        group: "web".into(),
        address: backend.to_string(),
    }];
    config.routes = vec![route("site", "/", action)];
    config
}

pub fn route(name: &str, prefix: &str, action: RouteAction) -> RouteConfig {
    RouteConfig {
        name: name.into(),
        host: None,
        path_prefix: Some(prefix.into()),
        priority: 0,
        action,
        backend_group: Some("web".into()),
        resource: None,
        redirect: None,
        headers: Vec::new(),
        not_found_page: None,
        internal_error_page: None,
    }
}

/// A proxy serving on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub pipeline: Arc<Pipeline>,
    pub reloader: Reloader,
    pub reporter: Arc<RecordingReporter>,
    shutdown: Shutdown,
    _updates: mpsc::UnboundedSender<ProxyConfig>,
}

impl TestProxy {
    pub async fn start(config: ProxyConfig) -> Self {
        let reporter = Arc::new(RecordingReporter::default());
        let mut collaborators = Collaborators::from_config(&config).unwrap();
        collaborators.reporter = reporter.clone();
        let server = HttpServer::with_collaborators(config, collaborators).unwrap();

        let pipeline = server.pipeline().clone();
        let reloader = server.reloader();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(server.run(listener, rx, shutdown.subscribe()));

        Self {
            addr,
            pipeline,
            reloader,
            reporter,
            shutdown,
            _updates: tx,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn cache_len(&self) -> usize {
        self.pipeline.forwarder().cache().len()
    }

    /// Wait until the cache holds `n` entries; commits finish after the
    /// client has read the body.
    pub async fn wait_for_entries(&self, n: usize) {
        for _ in 0..100 {
            if self.cache_len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(self.cache_len(), n, "cache never reached {n} entries");
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Poll `check` for up to a second.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
