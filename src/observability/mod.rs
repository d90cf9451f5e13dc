//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, runtime-adjustable level)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Connection id and proxy name are structured fields on every event
//! - Metrics are cheap (atomic increments) and no-ops until an exporter is installed
//! - The log filter sits behind a reload layer so `log-level` patches apply live

pub mod logging;
pub mod metrics;

pub use logging::{LogError, LogHandle, LogLevel};
