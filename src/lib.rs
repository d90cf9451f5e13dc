//! Rule-based traffic tunnel library.

pub mod adapter;
pub mod config;
pub mod engine;
pub mod health;
pub mod inbound;
pub mod lifecycle;
pub mod observability;
pub mod profile;
pub mod provider;
pub mod report;
pub mod resolver;
pub mod rules;
pub mod statistic;
pub mod tunnel;

pub use config::schema::TunnelConfig;
pub use engine::{Engine, EngineError, EngineOptions};
pub use lifecycle::Shutdown;
pub use tunnel::Tunnel;
