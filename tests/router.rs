//! Router-level tests driven with `oneshot`, no listening socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use edge_proxy::config::schema::{HeaderMutationConfig, HeaderOp, RedirectConfig, RouteAction};
use edge_proxy::content::StaticPages;
use edge_proxy::http::{Collaborators, ConnectionInfo, HttpServer, TlsInfo};
use edge_proxy::ProxyConfig;

mod common;
use common::{proxy_config, route, MockBackend, MockResponse};

fn plain() -> ConnectionInfo {
    let peer: SocketAddr = "192.0.2.10:50000".parse().unwrap();
    let local: SocketAddr = "192.0.2.1:80".parse().unwrap();
    ConnectionInfo::plain(peer, local)
}

fn secure() -> ConnectionInfo {
    ConnectionInfo {
        tls: Some(TlsInfo {
            protocol: "TLSv1.3".into(),
            cipher: "TLS_AES_128_GCM_SHA256".into(),
        }),
        ..plain()
    }
}

fn app(config: ProxyConfig, connection: ConnectionInfo) -> (HttpServer, Router) {
    let mut collaborators = Collaborators::from_config(&config).unwrap();
    let mut pages = StaticPages::new();
    pages.insert("robots.txt", "User-agent: *\nDisallow:\n");
    pages.insert(".well-known/acme-challenge/tok123", "tok123.key");
    collaborators.content = Arc::new(pages);
    let server = HttpServer::with_collaborators(config, collaborators).unwrap();
    let router = server.router().layer(MockConnectInfo(connection));
    (server, router)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, "www.example.com")
        .body(Body::empty())
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn static_route_serves_resource() {
    let mut config = ProxyConfig::default();
    let mut robots = route("robots", "/robots.txt", RouteAction::Static);
    robots.backend_group = None;
    robots.resource = Some("robots.txt".into());
    config.routes = vec![robots];
    let (_server, router) = app(config, plain());

    let response = router.oneshot(get("/robots.txt")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_text(response).await, "User-agent: *\nDisallow:\n");
}

#[tokio::test]
async fn acme_challenge_bypasses_routes() {
    let mut config = ProxyConfig::default();
    let mut blocked = route("blocked", "/", RouteAction::NotFound);
    blocked.backend_group = None;
    config.routes = vec![blocked];
    let (_server, router) = app(config, plain());

    let response = router
        .oneshot(get("/.well-known/acme-challenge/tok123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "tok123.key");
}

#[tokio::test]
async fn redirect_route_composes_location() {
    let mut config = ProxyConfig::default();
    let mut upgrade = route("upgrade", "/", RouteAction::Redirect);
    upgrade.backend_group = None;
    upgrade.redirect = Some(RedirectConfig {
        scheme: "https".into(),
        status: Some(301),
        ..RedirectConfig::default()
    });
    config.routes = vec![upgrade];
    let (_server, router) = app(config, plain());

    let response = router.oneshot(get("/login?next=%2Fhome")).await.unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers()[header::LOCATION],
        "https://www.example.com/login?next=%2Fhome"
    );
}

#[tokio::test]
async fn unmatched_request_is_not_found_with_mutations() {
    let mut config = ProxyConfig::default();
    let mut api = route("api", "/api", RouteAction::NotFound);
    api.backend_group = None;
    api.headers = vec![HeaderMutationConfig {
        op: HeaderOp::Set,
        name: "x-served-by".into(),
        value: "edge".into(),
    }];
    config.routes = vec![api];
    let (_server, router) = app(config, plain());

    let matched = router.clone().oneshot(get("/api/v1")).await.unwrap();
    assert_eq!(matched.status(), StatusCode::NOT_FOUND);
    assert_eq!(matched.headers()["x-served-by"], "edge");

    let unmatched = router.oneshot(get("/elsewhere")).await.unwrap();
    assert_eq!(unmatched.status(), StatusCode::NOT_FOUND);
    assert!(unmatched.headers().get("x-served-by").is_none());
    assert!(body_text(unmatched).await.contains("404 Not Found"));
}

#[tokio::test]
async fn secure_requests_cache_only_when_public() {
    let backend = MockBackend::start(MockResponse::ok("tls content")).await;
    let config = proxy_config(backend.addr, RouteAction::ProxyAndCache);
    let (server, router) = app(config, secure());
    let cache = server.pipeline().forwarder().cache().clone();

    let response = router.clone().oneshot(get("/private")).await.unwrap();
    assert_eq!(body_text(response).await, "tls content");
    assert!(cache.is_empty());

    let public = Request::builder()
        .uri("/public")
        .header(header::HOST, "www.example.com")
        .header(header::CACHE_CONTROL, "public")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(public).await.unwrap();
    assert_eq!(body_text(response).await, "tls content");
    assert!(common::eventually(|| cache.len() == 1).await);

    let hit = router.oneshot(get("/public")).await.unwrap();
    assert!(hit.headers().contains_key("x-cache-origin"));
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn fixed_mapper_sends_everything_to_one_group() {
    let backend = MockBackend::start(MockResponse::ok("fixed")).await;
    let mut config = proxy_config(backend.addr, RouteAction::Proxy);
    config.routes.clear();
    config.routing.mapper = "fixed".into();
    config.routing.fixed_group = Some("web".into());
    let (_server, router) = app(config, plain());

    let response = router.oneshot(get("/any/path")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "fixed");

    let head = backend.last_request().unwrap();
    assert!(head.starts_with("GET /any/path HTTP/1.1"), "{head}");
    assert!(head.to_ascii_lowercase().contains("host: www.example.com"), "{head}");
}
