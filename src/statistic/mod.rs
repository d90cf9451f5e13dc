//! Connection statistics subsystem.
//!
//! # Data Flow
//! ```text
//! Tunnel establishes upstream
//!     → ConnectionRegistry::register (UUID, metadata, chain, rule)
//!     → TrackedStream wraps the inbound side
//!         poll_read  → upload counters (connection + global)
//!         poll_write → download counters (connection + global)
//!     → Drop of TrackedStream unregisters
//!
//! Façade:
//!     snapshot() / close(id) / close_all() / traffic()
//! ```
//!
//! # Design Decisions
//! - Counters are atomics; a snapshot reads each one once, never locks the pump
//! - close(id) removes the record first, then signals the pump, so a second
//!   close reports not found
//! - Unregister is an idempotent map removal

pub mod registry;
pub mod tracker;

pub use registry::{ConnectionRegistry, ConnectionSnapshot, RegistryError, RegistrySnapshot, Traffic};
pub use tracker::{TrackedConnection, TrackedStream};
