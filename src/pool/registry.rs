//! Pool selection and atomic reload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;

use crate::config::schema::PoolConfig;
use crate::observability::metrics::MetricsScope;
use crate::pool::connection_pool::ConnectionPool;
use crate::pool::endpoint::EndpointKey;
use crate::pool::policy::PoolPolicy;

/// One immutable generation of pools.
pub struct PoolSet {
    generation: u64,
    /// Enabled non-default pools, in configuration order.
    pools: Vec<Arc<ConnectionPool>>,
    default: Arc<ConnectionPool>,
}

impl PoolSet {
    fn build(
        policies: &[PoolConfig],
        endpoints: &[EndpointKey],
        generation: u64,
        scope: &MetricsScope,
    ) -> Self {
        let mut pools = Vec::new();
        let mut default = None;

        for config in policies {
            let policy = PoolPolicy::from_config(config);
            if policy.is_default() {
                if default.is_none() {
                    default = Some(policy);
                }
                continue;
            }
            if !policy.enabled {
                tracing::debug!(pool = %policy.id, "Skipping disabled pool policy");
                continue;
            }
            pools.push(Arc::new(ConnectionPool::new(policy, generation, endpoints, scope)));
        }

        let default_policy =
            default.unwrap_or_else(|| PoolPolicy::from_config(&PoolConfig::default()));
        let default = Arc::new(ConnectionPool::new(default_policy, generation, endpoints, scope));

        Self {
            generation,
            pools,
            default,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All pools of this generation, default last.
    pub fn pools(&self) -> impl Iterator<Item = &Arc<ConnectionPool>> {
        self.pools.iter().chain(std::iter::once(&self.default))
    }

    pub fn default_pool(&self) -> &Arc<ConnectionPool> {
        &self.default
    }

    fn resolve(&self, host: &str) -> &Arc<ConnectionPool> {
        self.pools
            .iter()
            .find(|pool| pool.policy().matches(host))
            .unwrap_or(&self.default)
    }
}

/// Owns the current [`PoolSet`] and swaps it on reload.
pub struct PoolRegistry {
    current: ArcSwap<PoolSet>,
    next_generation: AtomicU64,
    scope: MetricsScope,
}

impl PoolRegistry {
    pub fn new(policies: &[PoolConfig], endpoints: &[EndpointKey]) -> Self {
        let scope = MetricsScope::new();
        let set = PoolSet::build(policies, endpoints, 1, &scope);
        Self {
            current: ArcSwap::from_pointee(set),
            next_generation: AtomicU64::new(2),
            scope,
        }
    }

    /// Pool for `host`. Unmatched hosts use the default pool; never fails.
    pub fn resolve(&self, host: &str) -> Arc<ConnectionPool> {
        self.current.load().resolve(host).clone()
    }

    /// Current generation. Readers holding it keep a consistent view.
    pub fn snapshot(&self) -> Arc<PoolSet> {
        self.current.load_full()
    }

    pub fn metrics_scope(&self) -> &MetricsScope {
        &self.scope
    }

    /// Replace every pool with a fresh generation built from `policies`.
    ///
    /// The swap is atomic; old pools drain in the background. The returned
    /// handles complete when each old pool has been disposed.
    pub fn reload(&self, policies: &[PoolConfig], endpoints: &[EndpointKey]) -> Vec<JoinHandle<()>> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let fresh = Arc::new(PoolSet::build(policies, endpoints, generation, &self.scope));
        let old = self.current.swap(fresh);

        tracing::info!(
            old_generation = old.generation,
            new_generation = generation,
            endpoints = endpoints.len(),
            "Connection pools reloaded"
        );

        old.pools().map(|pool| pool.dispose()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> Vec<PoolConfig> {
        vec![
            PoolConfig {
                id: "api".into(),
                domain: "*.api.local".into(),
                ..PoolConfig::default()
            },
            PoolConfig {
                id: "off".into(),
                domain: "off.local".into(),
                enabled: false,
                ..PoolConfig::default()
            },
            PoolConfig {
                id: "fallback".into(),
                ..PoolConfig::default()
            },
        ]
    }

    #[test]
    fn resolves_first_match_or_default() {
        let registry = PoolRegistry::new(&pools(), &[]);
        assert_eq!(registry.resolve("v1.api.local:8080").id(), "api");
        assert_eq!(registry.resolve("off.local").id(), "fallback");
        assert_eq!(registry.resolve("unknown.example").id(), "fallback");
        assert_eq!(registry.resolve("").id(), "fallback");
    }

    #[test]
    fn synthesizes_default_pool() {
        let registry = PoolRegistry::new(&[], &[]);
        assert_eq!(registry.resolve("x").id(), "default");
    }

    #[test]
    fn pools_are_pre_provisioned() {
        let endpoint = EndpointKey::new("127.0.0.1", 3000).unwrap();
        let registry = PoolRegistry::new(&pools(), &[endpoint.clone()]);
        for pool in registry.snapshot().pools() {
            assert_eq!(pool.endpoints(), vec![endpoint.clone()]);
        }
    }

    #[tokio::test]
    async fn reload_swaps_and_unregisters_old_metrics() {
        let registry = PoolRegistry::new(&pools(), &[]);
        let before = registry.snapshot();
        assert_eq!(registry.metrics_scope().live_series(), 2);

        let drains = registry.reload(&[], &[]);
        assert_eq!(registry.snapshot().generation(), before.generation() + 1);
        assert_eq!(registry.resolve("v1.api.local").id(), "default");

        for drain in drains {
            drain.await.unwrap();
        }
        assert!(before.pools().all(|p| p.is_closed()));
        assert_eq!(registry.metrics_scope().live_series(), 1);
    }
}
