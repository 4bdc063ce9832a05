//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Assemble pools, cache, forwarder, mapper and pipeline from config
//! - Create Axum Router with the catch-all handler
//! - Wire up middleware (tracing, request id, timeout, compression, limits)
//! - Serve until shutdown, applying config updates as they arrive
//! - Run the cache maintenance task for the server's lifetime

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response, StatusCode},
    routing::any,
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    compression::CompressionLayer,
    decompression::RequestDecompressionLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::cache::ContentCache;
use crate::config::loader::join_errors;
use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_with, ValidationError};
use crate::content::{StaticContent, StaticPages};
use crate::forward::{ForwardSettings, Forwarder};
use crate::health::{BackendHealth, FailureReporter};
use crate::http::context::ConnectionInfo;
use crate::lifecycle::Shutdown;
use crate::observability::access::{AccessLogSink, TracingAccessLog};
use crate::pipeline::Pipeline;
use crate::pool::PoolRegistry;
use crate::routing::router::configured_endpoints;
use crate::routing::{MapperRegistry, RoutingError};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid configuration: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("cannot load static pages from '{path}': {source}")]
    Pages {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// The pluggable pieces around the data plane.
pub struct Collaborators {
    /// Passive health; the route table skips what it marks unreachable.
    pub health: Arc<BackendHealth>,
    pub reporter: Arc<dyn FailureReporter>,
    pub content: Arc<dyn StaticContent>,
    pub access_log: Option<Arc<dyn AccessLogSink>>,
    pub mappers: MapperRegistry,
}

impl Collaborators {
    /// Default collaborators described by `config`.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, BuildError> {
        let health = Arc::new(BackendHealth::new(Duration::from_secs(config.health.recovery_secs)));

        let content: Arc<dyn StaticContent> = match &config.pages.root {
            Some(root) => Arc::new(StaticPages::load_dir(Path::new(root)).map_err(|source| {
                BuildError::Pages {
                    path: root.clone(),
                    source,
                }
            })?),
            None => Arc::new(StaticPages::new()),
        };

        let obs = &config.observability;
        let access_log = obs
            .access_log_enabled
            .then(|| Arc::new(TracingAccessLog::new(obs.access_log_format)) as Arc<dyn AccessLogSink>);

        Ok(Self {
            reporter: health.clone(),
            health,
            content,
            access_log,
            mappers: MapperRegistry::builtin(),
        })
    }
}

/// Applies new configurations to a running server.
#[derive(Clone)]
pub struct Reloader {
    pipeline: Arc<Pipeline>,
    health: Arc<BackendHealth>,
    mappers: Arc<MapperRegistry>,
}

impl Reloader {
    /// Swap in the mapper and the pools described by `config`.
    ///
    /// Nothing changes when `config` is invalid. Returns the drain tasks of
    /// the replaced pools.
    pub fn apply(&self, config: &ProxyConfig) -> Result<Vec<JoinHandle<()>>, BuildError> {
        validate_with(config, &self.mappers).map_err(BuildError::Invalid)?;
        let mapper = self.mappers.build(config, self.health.clone())?;

        self.pipeline.replace_mapper(mapper);
        let drains = self
            .pipeline
            .forwarder()
            .pools()
            .reload(&config.pools, &configured_endpoints(config));

        tracing::info!(
            routes = config.routes.len(),
            backends = config.backends.len(),
            pools = config.pools.len(),
            "Configuration applied"
        );
        Ok(drains)
    }

    async fn run(self, mut updates: mpsc::UnboundedReceiver<ProxyConfig>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some(config) = update else {
                        break;
                    };
                    if let Err(e) = self.apply(&config) {
                        tracing::error!(error = %e, "Rejected configuration update, keeping current configuration");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Reload loop stopped");
    }
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    reloader: Reloader,
}

impl HttpServer {
    /// Create a new HTTP server with the default collaborators.
    pub fn new(config: ProxyConfig) -> Result<Self, BuildError> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: ProxyConfig, collaborators: Collaborators) -> Result<Self, BuildError> {
        let Collaborators {
            health,
            reporter,
            content,
            access_log,
            mappers,
        } = collaborators;
        validate_with(&config, &mappers).map_err(BuildError::Invalid)?;

        let pools = Arc::new(PoolRegistry::new(&config.pools, &configured_endpoints(&config)));
        let cache = Arc::new(ContentCache::from_config(&config.cache));
        let forwarder = Arc::new(Forwarder::new(
            pools,
            cache,
            reporter,
            ForwardSettings::from(&config.forwarding),
        ));
        let mapper = mappers.build(&config, health.clone())?;
        let pipeline = Arc::new(Pipeline::new(mapper, forwarder, content, access_log));

        let router = Self::build_router(&config, pipeline.clone());
        Ok(Self {
            router,
            config,
            reloader: Reloader {
                pipeline,
                health,
                mappers: Arc::new(mappers),
            },
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, pipeline: Arc<Pipeline>) -> Router {
        let forwarding = &config.forwarding;
        let mut router = Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(pipeline);

        if forwarding.response_compression {
            router = router.layer(CompressionLayer::new());
        }
        if forwarding.request_compression {
            router = router.layer(RequestDecompressionLayer::new());
        }

        router
            .layer(ConcurrencyLimitLayer::new(config.listener.max_connections))
            .layer(request_timeout(forwarding.request_timeout_secs))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Returns once `shutdown` fires and in-flight connections have closed.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let tasks = Shutdown::new();
        let cache = self.reloader.pipeline.forwarder().cache().clone();
        tokio::spawn(cache.run_maintenance(tasks.subscribe()));
        tokio::spawn(self.reloader.clone().run(config_updates, tasks.subscribe()));

        let app = self
            .router
            .into_make_service_with_connect_info::<ConnectionInfo>();

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await;

        tasks.trigger();
        tracing::info!("HTTP server stopped");
        result
    }

    /// Router with all layers, for driving the server without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Handle that applies configuration updates to this server.
    pub fn reloader(&self) -> Reloader {
        self.reloader.clone()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.reloader.pipeline
    }

    pub fn health(&self) -> &Arc<BackendHealth> {
        &self.reloader.health
    }

    /// Get a reference to the config the server was built with.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

async fn proxy_handler(
    State(pipeline): State<Arc<Pipeline>>,
    ConnectInfo(connection): ConnectInfo<ConnectionInfo>,
    request: Request<Body>,
) -> Response<Body> {
    pipeline.process(connection, request).await
}

/// Last-resort deadline for a whole request; answers 504 when it fires.
fn request_timeout(secs: u64) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::GATEWAY_TIMEOUT, Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackendConfig, RouteAction, RouteConfig};
    use tower::ServiceExt;

    #[tokio::test(start_paused = true)]
    async fn request_timeout_answers_gateway_timeout() {
        let slow = Router::new()
            .route(
                "/",
                any(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "late"
                }),
            )
            .layer(request_timeout(1));
        let response = slow.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn builds_from_defaults() {
        let server = HttpServer::new(ProxyConfig::default()).unwrap();
        assert_eq!(server.pipeline().forwarder().pools().snapshot().pools().count(), 1);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = ProxyConfig::default();
        config.routing.mapper = "nope".into();
        assert!(matches!(HttpServer::new(config), Err(BuildError::Invalid(_))));
    }

    #[tokio::test]
    async fn reload_keeps_state_on_invalid_config() {
        let server = HttpServer::new(ProxyConfig::default()).unwrap();
        let reloader = server.reloader();
        let before = server.pipeline().forwarder().pools().snapshot().generation();

        let mut bad = ProxyConfig::default();
        bad.cache.default_ttl_secs = 0;
        assert!(reloader.apply(&bad).is_err());
        assert_eq!(server.pipeline().forwarder().pools().snapshot().generation(), before);

        let mut good = ProxyConfig::default();
        good.backends = vec![BackendConfig {
            name: "a".into(),
            group: "web".into(),
            address: "127.0.0.1:3000".into(),
        }];
        good.routes = vec![RouteConfig {
            name: "site".into(),
            host: None,
            path_prefix: Some("/".into()),
            priority: 0,
            action: RouteAction::Proxy,
            backend_group: Some("web".into()),
            resource: None,
            redirect: None,
            headers: Vec::new(),
            not_found_page: None,
            internal_error_page: None,
        }];
        let drains = reloader.apply(&good).unwrap();
        for drain in drains {
            drain.await.unwrap();
        }
        assert!(server.pipeline().forwarder().pools().snapshot().generation() > before);
    }
}
