//! Per-request dispatch.
//!
//! # Responsibilities
//! - Map the request to a decision and create its context
//! - Run exactly one branch per action and produce exactly one response
//! - Apply the decision's header mutations to whatever came out
//!
//! # Design Decisions
//! - Every branch consumes the context; its drop writes the access record
//! - A missing decision becomes an internal error, never a panic
//! - Forwarding failures fall back to generic pages with no backend detail

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{header, request::Parts, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Version};

use crate::cache::CacheKey;
use crate::clock;
use crate::content::{RenderedPage, StaticContent};
use crate::forward::{ForwardError, ForwardOutcome, Forwarder};
use crate::http::context::{ConnectionInfo, RequestContext};
use crate::observability::access::AccessLogSink;
use crate::pipeline::redirect::compose_location;
use crate::routing::{apply_mutations, Action, Mapper, PageSpec, RedirectTarget, RoutingDecision};

/// The request pipeline shared by all connections.
pub struct Pipeline {
    mapper: ArcSwap<Arc<dyn Mapper>>,
    forwarder: Arc<Forwarder>,
    content: Arc<dyn StaticContent>,
    access_log: Option<Arc<dyn AccessLogSink>>,
}

impl Pipeline {
    pub fn new(
        mapper: Arc<dyn Mapper>,
        forwarder: Arc<Forwarder>,
        content: Arc<dyn StaticContent>,
        access_log: Option<Arc<dyn AccessLogSink>>,
    ) -> Self {
        Self {
            mapper: ArcSwap::from_pointee(mapper),
            forwarder,
            content,
            access_log,
        }
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// Requests mapped after this call use `mapper`.
    pub fn replace_mapper(&self, mapper: Arc<dyn Mapper>) {
        self.mapper.store(Arc::new(mapper));
    }

    /// Produce the single response for `request`.
    pub async fn process(&self, connection: ConnectionInfo, request: Request<Body>) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let mapper = self.mapper.load_full();
        let decision = mapper
            .map(&RequestContext::view(&parts, &connection))
            .unwrap_or_else(RoutingDecision::no_route);
        let decision = Arc::new(decision);
        let ctx = RequestContext::new(connection, &parts, decision.clone(), self.access_log.clone());
        let request = Request::from_parts(parts, body);

        tracing::debug!(
            request_id = ctx.id(),
            method = %ctx.method(),
            host = ctx.host(),
            path = ctx.path(),
            action = decision.action.id(),
            route = %decision.route_id,
            "Request mapped"
        );

        let mut response = match decision.action {
            Action::NotFound => self.not_found(ctx, &**mapper),
            Action::InternalError => {
                tracing::warn!(
                    request_id = ctx.id(),
                    route = %decision.route_id,
                    reason = decision.reason.as_deref().unwrap_or("-"),
                    "Internal error decision"
                );
                self.internal_error(ctx, &**mapper)
            }
            Action::Static | Action::AcmeChallenge => {
                let page = self
                    .content
                    .render_page(StatusCode::OK, decision.resource.as_deref());
                self.simple(ctx, page)
            }
            Action::Redirect => self.redirect(ctx, decision.redirect.as_ref(), &**mapper),
            Action::Proxy => self.proxy(ctx, request, false, &**mapper).await,
            Action::ProxyAndCache => {
                let mut ctx = ctx;
                let (parts, body) = request.into_parts();
                match self.cached(&mut ctx, &parts).await {
                    Some(response) => response,
                    None => {
                        let request = Request::from_parts(parts, body);
                        self.proxy(ctx, request, true, &**mapper).await
                    }
                }
            }
        };

        apply_mutations(response.headers_mut(), &decision.headers);
        response
    }

    /// Serve a cache hit, or `None` to forward.
    async fn cached(&self, ctx: &mut RequestContext, parts: &Parts) -> Option<Response<Body>> {
        let cache = self.forwarder.cache();
        if !cache.is_enabled() || parts.method != Method::GET {
            return None;
        }

        let key = CacheKey::from_parts(&parts.method, &parts.uri, &parts.headers, ctx.is_secure());
        let if_modified_since = parts
            .headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(clock::parse_http_date);
        let entry = cache.lookup(&key).await?;

        let mut response = entry.to_response(if_modified_since);
        add_keep_alive(ctx, response.headers_mut());
        ctx.mark_from_cache();
        ctx.set_status(response.status());
        ctx.mark_headers_sent();
        tracing::debug!(request_id = ctx.id(), key = %key, status = response.status().as_u16(), "Cache hit");
        Some(response)
    }

    async fn proxy(
        &self,
        ctx: RequestContext,
        request: Request<Body>,
        cache_enabled: bool,
        mapper: &dyn Mapper,
    ) -> Response<Body> {
        match self.forwarder.forward(ctx, request, cache_enabled).await {
            ForwardOutcome::Streaming(response) => response,
            ForwardOutcome::Failed(ctx, err) => self.forward_failed(ctx, err, mapper),
        }
    }

    fn forward_failed(&self, ctx: RequestContext, err: ForwardError, mapper: &dyn Mapper) -> Response<Body> {
        if err.status() == StatusCode::INTERNAL_SERVER_ERROR {
            return self.internal_error(ctx, mapper);
        }
        let page = self.content.render_page(err.status(), None);
        self.simple(ctx, page)
    }

    fn not_found(&self, ctx: RequestContext, mapper: &dyn Mapper) -> Response<Body> {
        let page = ctx
            .decision()
            .page
            .clone()
            .or_else(|| mapper.not_found_page(&ctx.decision().route_id));
        self.page(ctx, page, StatusCode::NOT_FOUND)
    }

    fn internal_error(&self, ctx: RequestContext, mapper: &dyn Mapper) -> Response<Body> {
        let page = match ctx.action() {
            Action::InternalError => ctx.decision().page.clone(),
            _ => None,
        }
        .or_else(|| mapper.internal_error_page(&ctx.decision().route_id));
        self.page(ctx, page, StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn page(&self, ctx: RequestContext, page: Option<PageSpec>, fallback: StatusCode) -> Response<Body> {
        let (status, resource, headers) = match page {
            Some(page) => (page.status, page.resource, page.headers),
            None => (fallback, None, Vec::new()),
        };
        let mut response = self.simple(ctx, self.content.render_page(status, resource.as_deref()));
        apply_mutations(response.headers_mut(), &headers);
        response
    }

    fn redirect(&self, ctx: RequestContext, target: Option<&RedirectTarget>, mapper: &dyn Mapper) -> Response<Body> {
        let default_target = RedirectTarget::default();
        let target = target.unwrap_or(&default_target);
        let path_and_query = ctx
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = compose_location(target, ctx.host(), path_and_query);

        let Ok(value) = HeaderValue::from_str(&location) else {
            tracing::warn!(request_id = ctx.id(), location = %location, "Unusable redirect location");
            return self.internal_error(ctx, mapper);
        };
        let status = if target.status.is_redirection() {
            target.status
        } else {
            StatusCode::FOUND
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, value);
        self.simple(
            ctx,
            RenderedPage {
                status,
                headers,
                body: bytes::Bytes::new(),
            },
        )
    }

    /// Finish a non-streamed response.
    fn simple(&self, mut ctx: RequestContext, page: RenderedPage) -> Response<Body> {
        let RenderedPage { status, mut headers, body } = page;
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        add_keep_alive(&ctx, &mut headers);

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        ctx.set_status(status);
        ctx.mark_headers_sent();
        response
    }
}

/// HTTP/1.x clients that asked to keep the connection get it confirmed.
fn add_keep_alive(ctx: &RequestContext, headers: &mut HeaderMap) {
    if ctx.keep_alive() && matches!(ctx.version(), Version::HTTP_10 | Version::HTTP_11) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePolicy, ContentCache};
    use crate::config::schema::{CacheConfig, PoolConfig};
    use crate::content::StaticPages;
    use crate::forward::ForwardSettings;
    use crate::health::NoopReporter;
    use crate::observability::access::AccessRecord;
    use crate::pool::PoolRegistry;
    use crate::routing::{HeaderMutation, RedirectScheme, RequestView};
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixed(RoutingDecision);

    impl Mapper for Fixed {
        fn map(&self, _request: &RequestView<'_>) -> Option<RoutingDecision> {
            Some(self.0.clone())
        }
        fn not_found_page(&self, _route_id: &str) -> Option<PageSpec> {
            None
        }
        fn internal_error_page(&self, _route_id: &str) -> Option<PageSpec> {
            Some(PageSpec {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                resource: Some("oops.html".into()),
                headers: Vec::new(),
            })
        }
    }

    struct Nothing;

    impl Mapper for Nothing {
        fn map(&self, _request: &RequestView<'_>) -> Option<RoutingDecision> {
            None
        }
        fn not_found_page(&self, _route_id: &str) -> Option<PageSpec> {
            None
        }
        fn internal_error_page(&self, _route_id: &str) -> Option<PageSpec> {
            None
        }
    }

    #[derive(Default)]
    struct Log(Mutex<Vec<AccessRecord>>);

    impl AccessLogSink for Log {
        fn log(&self, record: &AccessRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    fn pipeline(mapper: Arc<dyn Mapper>, log: Arc<Log>) -> Pipeline {
        let pools = Arc::new(PoolRegistry::new(&[PoolConfig::default()], &[]));
        let cache = Arc::new(ContentCache::new(CachePolicy::from(&CacheConfig::default())));
        let forwarder = Arc::new(Forwarder::new(
            pools,
            cache,
            Arc::new(NoopReporter),
            ForwardSettings {
                stuck_timeout: Duration::from_secs(1),
                mark_stuck_unreachable: false,
            },
        ));
        let mut pages = StaticPages::new();
        pages.insert("oops.html", "custom oops");
        Pipeline::new(mapper, forwarder, Arc::new(pages), Some(log))
    }

    fn conn() -> ConnectionInfo {
        let addr = "127.0.0.1:9".parse().unwrap();
        ConnectionInfo::plain(addr, addr)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "site.test:8080")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn not_found_with_mutations_logs_once() {
        let log = Arc::new(Log::default());
        let decision = RoutingDecision::not_found("site").with_headers(vec![
            HeaderMutation::Set(header::SERVER, HeaderValue::from_static("edge")),
            HeaderMutation::Add(header::VARY, HeaderValue::from_static("accept")),
        ]);
        let p = pipeline(Arc::new(Fixed(decision)), log.clone());

        let response = p.process(conn(), get("/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::SERVER], "edge");
        assert_eq!(response.headers()[header::VARY], "accept");
        assert!(response.headers().contains_key(header::CONTENT_LENGTH));

        let records = log.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 404);
        assert_eq!(records[0].route_id, "site");
    }

    #[tokio::test]
    async fn cached_proxy_future_can_cross_threads() {
        fn assert_send<F: std::future::Future + Send>(_: F) {}
        let target = crate::pool::EndpointKey::new("127.0.0.1", 9).unwrap();
        let decision = RoutingDecision::proxy("site", target, true);
        let p = pipeline(Arc::new(Fixed(decision)), Arc::new(Log::default()));
        assert_send(p.process(conn(), get("/page")));
    }

    #[tokio::test]
    async fn missing_decision_is_internal_error() {
        let log = Arc::new(Log::default());
        let p = pipeline(Arc::new(Nothing), log.clone());
        let response = p.process(conn(), get("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(log.0.lock().unwrap()[0].route_id, crate::routing::decision::NO_ROUTE);
    }

    #[tokio::test]
    async fn internal_error_uses_mapper_page() {
        let log = Arc::new(Log::default());
        let p = pipeline(
            Arc::new(Fixed(RoutingDecision::internal_error("site", "broken"))),
            log,
        );
        let response = p.process(conn(), get("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "custom oops");
    }

    #[tokio::test]
    async fn redirect_forces_scheme() {
        let log = Arc::new(Log::default());
        let mut decision = RoutingDecision::new(Action::Redirect, "tls");
        decision.redirect = Some(RedirectTarget {
            scheme: RedirectScheme::Https,
            status: StatusCode::MOVED_PERMANENTLY,
            ..Default::default()
        });
        let p = pipeline(Arc::new(Fixed(decision)), log);

        let response = p.process(conn(), get("/login?next=%2F")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "https://site.test/login?next=%2F");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "0");
    }

    #[tokio::test]
    async fn http10_keep_alive_is_confirmed() {
        let log = Arc::new(Log::default());
        let p = pipeline(Arc::new(Fixed(RoutingDecision::not_found("site"))), log);
        let request = Request::builder()
            .uri("/")
            .version(Version::HTTP_10)
            .header(header::CONNECTION, "keep-alive")
            .body(Body::empty())
            .unwrap();
        let response = p.process(conn(), request).await;
        assert_eq!(response.headers()[header::CONNECTION], "keep-alive");
    }

    #[tokio::test]
    async fn proxy_without_target_renders_error_page() {
        let log = Arc::new(Log::default());
        let p = pipeline(
            Arc::new(Fixed(RoutingDecision::new(Action::Proxy, "site"))),
            log.clone(),
        );
        let response = p.process(conn(), get("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert_eq!(body, "custom oops");
        assert_eq!(log.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replaced_mapper_takes_effect() {
        let log = Arc::new(Log::default());
        let p = pipeline(Arc::new(Nothing), log);
        p.replace_mapper(Arc::new(Fixed(RoutingDecision::not_found("new"))));
        let response = p.process(conn(), get("/")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
