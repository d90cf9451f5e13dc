//! Persistent profile state.

pub mod cache;

pub use cache::SelectionCache;
