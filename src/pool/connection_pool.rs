//! A connection pool bound to one pool policy.
//!
//! # Responsibilities
//! - Hold one reusable HTTP client per backend endpoint
//! - Cap concurrent requests per endpoint (semaphore, bounded borrow wait)
//! - Rotate clients whose connections exceeded the policy's max lifetime
//! - Drain and force-close on disposal
//!
//! # Design Decisions
//! - A [`Lease`] is an RAII guard: dropping it frees the endpoint slot and
//!   decrements the pool's in-flight count
//! - Force-close is broadcast on a `watch` channel that streaming bodies
//!   select on; a stream that sees it drops its backend connection

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::body::Body;
use dashmap::DashMap;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::observability::metrics::{MetricsScope, PoolMetrics};
use crate::pool::endpoint::EndpointKey;
use crate::pool::policy::PoolPolicy;

/// Backend HTTP client type shared by all pools.
pub type HttpClient = Client<HttpConnector, Body>;

/// Poll interval while a disposed pool drains.
const DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no free connection slot for {endpoint} within {waited:?}")]
    Exhausted { endpoint: EndpointKey, waited: Duration },

    #[error("pool '{0}' is closed")]
    Closed(String),
}

struct ClientGeneration {
    client: HttpClient,
    created: Instant,
}

impl ClientGeneration {
    fn new(policy: &PoolPolicy) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(policy.connect_timeout));
        connector.set_keepalive(Some(policy.keep_alive_idle));
        connector.set_keepalive_interval(Some(policy.keep_alive_interval));
        connector.set_keepalive_retries(Some(policy.keep_alive_count));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(policy.idle_timeout)
            .pool_max_idle_per_host(policy.max_connections_per_endpoint)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Self {
            client,
            created: Instant::now(),
        }
    }
}

/// Per-endpoint state inside one pool.
pub struct EndpointClient {
    endpoint: EndpointKey,
    limit: Arc<Semaphore>,
    current: ArcSwap<ClientGeneration>,
}

impl EndpointClient {
    fn new(endpoint: EndpointKey, policy: &PoolPolicy) -> Self {
        Self {
            endpoint,
            limit: Arc::new(Semaphore::new(policy.max_connections_per_endpoint)),
            current: ArcSwap::from_pointee(ClientGeneration::new(policy)),
        }
    }

    /// The current client, replaced first if it outlived `max_lifetime`.
    ///
    /// Requests already running on the old client keep their connection;
    /// its idle connections close once the last clone is dropped.
    fn client(&self, policy: &PoolPolicy) -> HttpClient {
        let current = self.current.load();
        if current.created.elapsed() >= policy.max_lifetime {
            let fresh = Arc::new(ClientGeneration::new(policy));
            self.current.compare_and_swap(&current, fresh);
            tracing::debug!(endpoint = %self.endpoint, pool = %policy.id, "Rotated backend client");
        }
        self.current.load().client.clone()
    }

    /// Free slots left for this endpoint.
    pub fn available(&self) -> usize {
        self.limit.available_permits()
    }
}

struct PoolShared {
    in_flight: AtomicUsize,
    metrics: Mutex<Option<PoolMetrics>>,
}

impl PoolShared {
    fn publish_in_flight(&self, value: usize) {
        if let Ok(guard) = self.metrics.lock() {
            if let Some(metrics) = guard.as_ref() {
                metrics.set_in_flight(value);
            }
        }
    }
}

/// Runtime pool for one [`PoolPolicy`].
pub struct ConnectionPool {
    policy: Arc<PoolPolicy>,
    generation: u64,
    clients: DashMap<EndpointKey, Arc<EndpointClient>>,
    shared: Arc<PoolShared>,
    closing: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl ConnectionPool {
    /// Build a pool with a client pre-provisioned for every known endpoint.
    pub fn new(
        policy: PoolPolicy,
        generation: u64,
        endpoints: &[EndpointKey],
        scope: &MetricsScope,
    ) -> Self {
        let clients = DashMap::new();
        for endpoint in endpoints {
            clients.insert(
                endpoint.clone(),
                Arc::new(EndpointClient::new(endpoint.clone(), &policy)),
            );
        }

        let metrics = scope.register_pool(&policy.id, generation);
        metrics.set_endpoints(clients.len());
        metrics.set_in_flight(0);

        let (closed_tx, _) = watch::channel(false);
        Self {
            policy: Arc::new(policy),
            generation,
            clients,
            shared: Arc::new(PoolShared {
                in_flight: AtomicUsize::new(0),
                metrics: Mutex::new(Some(metrics)),
            }),
            closing: AtomicBool::new(false),
            closed_tx,
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn id(&self) -> &str {
        &self.policy.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Requests currently holding a lease.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Endpoints with a provisioned client.
    pub fn endpoints(&self) -> Vec<EndpointKey> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    /// Free slots for `endpoint`, if it has been provisioned.
    pub fn available(&self, endpoint: &EndpointKey) -> Option<usize> {
        self.clients.get(endpoint).map(|c| c.available())
    }

    fn endpoint_client(&self, endpoint: &EndpointKey) -> Arc<EndpointClient> {
        if let Some(existing) = self.clients.get(endpoint) {
            return existing.clone();
        }
        let client = self
            .clients
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(EndpointClient::new(endpoint.clone(), &self.policy)))
            .clone();
        if let Ok(guard) = self.shared.metrics.lock() {
            if let Some(metrics) = guard.as_ref() {
                metrics.set_endpoints(self.clients.len());
            }
        }
        client
    }

    /// Borrow a slot for `endpoint`, waiting at most the borrow timeout.
    pub async fn lease(&self, endpoint: &EndpointKey) -> Result<Lease, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed(self.policy.id.clone()));
        }

        let endpoint_client = self.endpoint_client(endpoint);
        let acquire = endpoint_client.limit.clone().acquire_owned();
        let permit = match tokio::time::timeout(self.policy.borrow_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed(self.policy.id.clone())),
            Err(_) => {
                return Err(PoolError::Exhausted {
                    endpoint: endpoint.clone(),
                    waited: self.policy.borrow_timeout,
                })
            }
        };

        let in_flight = self.shared.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.publish_in_flight(in_flight);

        Ok(Lease {
            client: endpoint_client.client(&self.policy),
            endpoint: endpoint.clone(),
            pool_id: self.policy.id.clone(),
            shared: self.shared.clone(),
            closed: self.closed_tx.subscribe(),
            _permit: permit,
        })
    }

    /// Stop the pool: wait for in-flight leases up to the dispose timeout,
    /// then force-close whatever is left.
    ///
    /// Returns immediately; the drain runs on the returned task.
    pub fn dispose(self: &Arc<Self>) -> JoinHandle<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return tokio::spawn(async {});
        }

        let pool = self.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + pool.policy.dispose_timeout;
            while pool.in_flight() > 0 && Instant::now() < deadline {
                tokio::time::sleep(DRAIN_POLL).await;
            }

            let remaining = pool.in_flight();
            if remaining > 0 {
                tracing::warn!(
                    pool = %pool.policy.id,
                    generation = pool.generation,
                    in_flight = remaining,
                    "Dispose timeout reached, force-closing connections"
                );
            }

            pool.closed_tx.send_replace(true);
            for entry in pool.clients.iter() {
                entry.limit.close();
            }
            pool.clients.clear();
            if let Ok(mut metrics) = pool.shared.metrics.lock() {
                metrics.take();
            }

            tracing::info!(
                pool = %pool.policy.id,
                generation = pool.generation,
                "Connection pool disposed"
            );
        })
    }
}

/// An endpoint slot borrowed from a pool.
pub struct Lease {
    client: HttpClient,
    endpoint: EndpointKey,
    pool_id: String,
    shared: Arc<PoolShared>,
    closed: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn endpoint(&self) -> &EndpointKey {
        &self.endpoint
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Resolves once the owning pool has been force-closed.
    pub async fn force_closed(&mut self) {
        if self.closed.wait_for(|closed| *closed).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let in_flight = self.shared.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.shared.publish_in_flight(in_flight);
    }
}
