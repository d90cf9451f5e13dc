//! Background health checking.
//!
//! # Data Flow
//! ```text
//! Periodic timer (active.rs)
//!     → Resolve current members of a group or provider
//!     → Probe every member concurrently (Proxy::probe)
//!     → Delay, mean delay and alive state recorded on each proxy
//!     → URLTest / Fallback / LoadBalance read them on the next connect
//! ```
//!
//! # Design Decisions
//! - Health state lives on the proxy (adapter/health.rs), not here
//! - Monitors are owned by a config epoch and exit when it is shut down
//! - One slow member never delays the others: probes run concurrently

pub mod active;

pub use active::{check_all, HealthMonitor, HealthTarget};
