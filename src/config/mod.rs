//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, all errors at once)
//!     → ProxyConfig (validated, immutable)
//!     → HttpServer builds pools, cache, mapper, forwarder
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → mpsc channel → HttpServer reload loop
//!     → mapper swap + PoolRegistry::reload
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackendConfig, CacheConfig, ForwardingConfig, ListenerConfig, ObservabilityConfig, PoolConfig,
    ProxyConfig, RouteConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
