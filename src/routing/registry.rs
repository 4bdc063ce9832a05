//! Mapper strategies registered by id.
//!
//! The configured `routing.mapper` id is checked against this table when
//! the configuration is validated, not when the first request arrives.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::schema::ProxyConfig;
use crate::health::BackendHealth;
use crate::routing::mapper::Mapper;
use crate::routing::router::{FixedMapper, RouteTable, RoutingError};

type MapperFactory = fn(&ProxyConfig, Arc<BackendHealth>) -> Result<Arc<dyn Mapper>, RoutingError>;

fn route_table(config: &ProxyConfig, health: Arc<BackendHealth>) -> Result<Arc<dyn Mapper>, RoutingError> {
    Ok(Arc::new(RouteTable::new(config, health)?))
}

fn fixed(config: &ProxyConfig, health: Arc<BackendHealth>) -> Result<Arc<dyn Mapper>, RoutingError> {
    Ok(Arc::new(FixedMapper::new(config, health)?))
}

/// Table of mapper constructors keyed by strategy id.
pub struct MapperRegistry {
    factories: BTreeMap<&'static str, MapperFactory>,
}

impl MapperRegistry {
    /// Registry holding the built-in `routes` and `fixed` strategies.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("routes", route_table);
        registry.register("fixed", fixed);
        registry
    }

    pub fn register(&mut self, id: &'static str, factory: MapperFactory) {
        self.factories.insert(id, factory);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Build the mapper named by `config.routing.mapper`.
    pub fn build(
        &self,
        config: &ProxyConfig,
        health: Arc<BackendHealth>,
    ) -> Result<Arc<dyn Mapper>, RoutingError> {
        let id = config.routing.mapper.as_str();
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| RoutingError::UnknownMapper(id.to_string()))?;
        factory(config, health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn builtin_ids() {
        let registry = MapperRegistry::builtin();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["fixed", "routes"]);
        assert!(registry.contains("routes"));
        assert!(!registry.contains("regex"));
    }

    #[test]
    fn unknown_id_fails_to_build() {
        let mut config = ProxyConfig::default();
        config.routing.mapper = "regex".into();
        let health = Arc::new(BackendHealth::new(Duration::from_secs(1)));
        assert!(matches!(
            MapperRegistry::builtin().build(&config, health),
            Err(RoutingError::UnknownMapper(id)) if id == "regex"
        ));
    }
}
