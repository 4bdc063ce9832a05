//! Failure injection tests for the reverse proxy.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use edge_proxy::config::schema::{PoolConfig, RouteAction};

mod common;
use common::{client, closed_port, eventually, proxy_config, MockBackend, MockResponse, TestProxy};

/// Sends a response head and part of the body, then goes silent.
async fn stalling_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    addr
}

/// Streams the first chunk of a large body, then trickles nothing.
async fn slow_streaming_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\nfirst chunk")
                    .await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn refused_connection_is_503_and_reported_once() {
    let dead = closed_port().await;
    let proxy = TestProxy::start(proxy_config(dead, RouteAction::Proxy)).await;

    let response = client().get(proxy.url("/anything")).send().await.unwrap();
    assert_eq!(response.status(), 503);
    let body = response.text().await.unwrap();
    assert!(body.contains("503 Service Unavailable"), "{body}");
    assert!(!body.contains(&dead.to_string()), "backend address leaked: {body}");

    let reports = proxy.reporter.unreachable();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0.to_string(), dead.to_string());
    assert_eq!(proxy.pipeline.forwarder().pending(), 0);
}

#[tokio::test]
async fn slow_backend_is_stuck_before_headers() {
    let backend = MockBackend::start(MockResponse::ok("late").delayed(Duration::from_secs(2))).await;
    let mut config = proxy_config(backend.addr, RouteAction::Proxy);
    config.forwarding.stuck_timeout_ms = 200;
    let proxy = TestProxy::start(config).await;

    let response = client().get(proxy.url("/slow")).send().await.unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(proxy.pipeline.forwarder().stuck_requests(), 1);
    assert!(proxy.reporter.unreachable().is_empty());
}

#[tokio::test]
async fn stuck_body_breaks_the_client_response() {
    let backend = stalling_backend().await;
    let mut config = proxy_config(backend, RouteAction::ProxyAndCache);
    config.forwarding.stuck_timeout_ms = 200;
    config.forwarding.mark_stuck_unreachable = true;
    let proxy = TestProxy::start(config).await;

    let response = client().get(proxy.url("/stall")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.is_err(), "truncated body must not look complete");

    assert!(eventually(|| proxy.reporter.unreachable().len() == 1).await);
    assert_eq!(proxy.pipeline.forwarder().stuck_requests(), 1);
    assert_eq!(proxy.cache_len(), 0);
}

#[tokio::test]
async fn exhausted_pool_is_503_without_report() {
    let backend = MockBackend::start(MockResponse::ok("busy").delayed(Duration::from_millis(400))).await;
    let mut config = proxy_config(backend.addr, RouteAction::Proxy);
    config.pools = vec![PoolConfig {
        max_connections_per_endpoint: 1,
        borrow_timeout_ms: 100,
        ..PoolConfig::default()
    }];
    let proxy = TestProxy::start(config).await;
    let client = client();

    let first = tokio::spawn({
        let (client, url) = (client.clone(), proxy.url("/one"));
        async move { client.get(url).send().await.unwrap().status().as_u16() }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = client.get(proxy.url("/two")).send().await.unwrap().status().as_u16();

    assert_eq!(second, 503);
    assert_eq!(first.await.unwrap(), 200);
    assert!(proxy.reporter.unreachable().is_empty());
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn pool_reload_lets_in_flight_requests_finish() {
    let backend = MockBackend::start(MockResponse::ok("drained").delayed(Duration::from_millis(300))).await;
    let config = proxy_config(backend.addr, RouteAction::Proxy);
    let proxy = TestProxy::start(config.clone()).await;
    let before = proxy.pipeline.forwarder().pools().snapshot().generation();

    let in_flight = tokio::spawn({
        let (client, url) = (client(), proxy.url("/long"));
        async move {
            let response = client.get(url).send().await.unwrap();
            (response.status().as_u16(), response.text().await.unwrap())
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut reloaded = config;
    reloaded.pools = vec![PoolConfig {
        id: "edge".into(),
        ..PoolConfig::default()
    }];
    let drains = proxy.reloader.apply(&reloaded).unwrap();
    assert_eq!(drains.len(), 1);

    assert_eq!(in_flight.await.unwrap(), (200, "drained".to_string()));
    for drain in drains {
        tokio::time::timeout(Duration::from_secs(5), drain).await.unwrap().unwrap();
    }

    let snapshot = proxy.pipeline.forwarder().pools().snapshot();
    assert!(snapshot.generation() > before);
    assert_eq!(snapshot.default_pool().id(), "edge");

    let after = client().get(proxy.url("/next")).send().await.unwrap();
    assert_eq!(after.status(), 200);
    assert!(proxy.reporter.unreachable().is_empty());
}

#[tokio::test]
async fn client_disconnect_mid_body_releases_everything() {
    let backend = slow_streaming_backend().await;
    let mut config = proxy_config(backend, RouteAction::ProxyAndCache);
    config.forwarding.stuck_timeout_ms = 10_000;
    config.forwarding.mark_stuck_unreachable = true;
    let proxy = TestProxy::start(config).await;

    let mut response = client().get(proxy.url("/download")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let first = response.chunk().await.unwrap().unwrap();
    assert!(!first.is_empty());
    assert_eq!(proxy.pipeline.forwarder().pending(), 1);
    drop(response);

    let forwarder = proxy.pipeline.forwarder().clone();
    assert!(eventually(|| forwarder.pending() == 0).await, "forward still pending");
    assert!(
        eventually(|| forwarder.pools().snapshot().default_pool().in_flight() == 0).await,
        "lease not returned"
    );
    assert_eq!(proxy.cache_len(), 0);
    assert_eq!(forwarder.stuck_requests(), 0);
    assert!(proxy.reporter.unreachable().is_empty());
}
