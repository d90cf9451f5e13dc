//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) or bytes
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, group order)
//!     → TunnelConfig (validated, immutable)
//!     → tunnel::state builds a ConfigState from it
//!
//! On reload (SIGHUP, façade, or watcher.rs):
//!     loader.rs loads new config
//!     → validation.rs validates
//!     → Engine::apply_config swaps the ConfigState atomically
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
    GroupType, HealthCheckConfig, InboundConfig, ProviderConfig, ProxyConfig, ProxyGroupConfig, TunnelConfig,
    UnmatchedPolicy, VehicleKind,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
