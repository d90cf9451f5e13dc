//! Live connection registry.
//!
//! # Responsibilities
//! - Index established connections by UUID
//! - Keep global upload/download totals and per-second rates
//! - Serve snapshots and close requests for the reporting façade

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time;
use uuid::Uuid;

use crate::observability::metrics;
use crate::rules::RuleType;
use crate::statistic::tracker::TrackedConnection;
use crate::tunnel::Metadata;

/// Error type for registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} not found")]
    NotFound(Uuid),
}

/// One connection as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    pub metadata: Metadata,
    pub upload: u64,
    pub download: u64,
    pub start: DateTime<Utc>,
    pub chains: Vec<String>,
    pub rule: String,
    #[serde(rename = "rulePayload")]
    pub rule_payload: String,
}

/// All live connections plus global totals.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    #[serde(rename = "downloadTotal")]
    pub download_total: u64,
    #[serde(rename = "uploadTotal")]
    pub upload_total: u64,
    pub connections: Vec<ConnectionSnapshot>,
}

/// Bytes per second over the last tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Traffic {
    pub up: u64,
    pub down: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<TrackedConnection>>,
    upload_total: AtomicU64,
    download_total: AtomicU64,
    upload_window: AtomicU64,
    download_window: AtomicU64,
    upload_rate: AtomicU64,
    download_rate: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly established connection.
    pub fn register(
        &self,
        metadata: Metadata,
        chains: Vec<String>,
        rule: Option<RuleType>,
        rule_payload: String,
    ) -> Arc<TrackedConnection> {
        let conn = Arc::new(TrackedConnection::new(metadata, chains, rule, rule_payload));
        self.connections.insert(conn.id(), conn.clone());
        metrics::record_active_connections(self.connections.len());
        conn
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn unregister(&self, id: Uuid) -> bool {
        match self.connections.remove(&id) {
            Some((_, conn)) => {
                metrics::record_active_connections(self.connections.len());
                metrics::record_bytes(conn.upload(), conn.download());
                tracing::debug!(
                    conn_id = %id,
                    upload = conn.upload(),
                    download = conn.download(),
                    "Connection unregistered"
                );
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<TrackedConnection>> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    /// Close one connection. The record is gone when this returns.
    pub fn close(&self, id: Uuid) -> Result<(), RegistryError> {
        let conn = self.get(id).ok_or(RegistryError::NotFound(id))?;
        if !self.unregister(id) {
            return Err(RegistryError::NotFound(id));
        }
        conn.close();
        tracing::info!(conn_id = %id, "Connection closed on request");
        Ok(())
    }

    /// Close every live connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<Uuid> = self.connections.iter().map(|c| *c.key()).collect();
        ids.into_iter().filter(|id| self.close(*id).is_ok()).count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub(crate) fn add_upload(&self, n: u64) {
        self.upload_total.fetch_add(n, Ordering::Relaxed);
        self.upload_window.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_download(&self, n: u64) {
        self.download_total.fetch_add(n, Ordering::Relaxed);
        self.download_window.fetch_add(n, Ordering::Relaxed);
    }

    /// Live connections, oldest first.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut connections: Vec<ConnectionSnapshot> = self.connections.iter().map(|c| c.snapshot()).collect();
        connections.sort_by_key(|c| c.start);
        RegistrySnapshot {
            download_total: self.download_total.load(Ordering::Relaxed),
            upload_total: self.upload_total.load(Ordering::Relaxed),
            connections,
        }
    }

    /// Rates measured over the last completed second.
    pub fn traffic(&self) -> Traffic {
        Traffic {
            up: self.upload_rate.load(Ordering::Relaxed),
            down: self.download_rate.load(Ordering::Relaxed),
        }
    }

    fn tick(&self) {
        self.upload_rate
            .store(self.upload_window.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.download_rate
            .store(self.download_window.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Roll the per-second rates until shutdown.
    pub async fn run_rate_ticker(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = shutdown.recv() => break,
            }
        }
    }
}
