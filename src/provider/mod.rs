//! Proxy providers.
//!
//! # Data Flow
//! ```text
//! Vehicle (file / HTTP)
//!     → raw bytes
//!     → SHA-256 compared with the active set (unchanged → keep)
//!     → TOML `[[proxies]]` parsed into leaf proxies
//!     → non-empty check
//!     → ArcSwap of the whole set
//!
//! Groups with `use = [...]` read ProxyProvider::proxies() on every resolve.
//! ```
//!
//! # Design Decisions
//! - A refresh replaces the set wholesale or not at all
//! - Failed refreshes are retried with capped exponential backoff
//! - HTTP content is cached to disk only after it parsed successfully
//! - Background loops belong to the config epoch and stop with it

mod backoff;
pub mod vehicle;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time;

use crate::adapter::{DialContext, ProbeOptions, Proxy};
use crate::config::schema::ProviderPayload;
use crate::health::{check_all, HealthMonitor, HealthTarget};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use backoff::Backoff;

pub use vehicle::{Vehicle, VehicleType};

/// First retry delay after a failed refresh.
const RETRY_BASE: Duration = Duration::from_secs(5);

/// Error type for provider refreshes.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetch {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid provider url {0}")]
    InvalidUrl(String),

    #[error("provider content is not valid UTF-8")]
    Encoding,

    #[error("failed to parse provider content: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("provider {0} has no proxies")]
    Empty(String),
}

/// Result of a successful refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new set with this many proxies is active.
    Updated(usize),
    /// Content hash matched the active set.
    Unchanged,
}

/// Provider timing and probing settings.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Refresh interval; zero disables the refresh loop.
    pub interval: Duration,
    /// Options for health checks, periodic or on demand.
    pub probe: ProbeOptions,
    /// Periodic health check interval, when enabled.
    pub health_interval: Option<Duration>,
}

#[derive(Debug, Default)]
struct ProviderSet {
    proxies: Arc<Vec<Arc<Proxy>>>,
    hash: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// A refreshable source of leaf proxies.
#[derive(Debug)]
pub struct ProxyProvider {
    name: String,
    vehicle: Vehicle,
    settings: ProviderSettings,
    dial: DialContext,
    current: ArcSwap<ProviderSet>,
    update_lock: Mutex<()>,
}

impl ProxyProvider {
    pub fn new(name: impl Into<String>, vehicle: Vehicle, settings: ProviderSettings, dial: DialContext) -> Self {
        Self {
            name: name.into(),
            vehicle,
            settings,
            dial,
            current: ArcSwap::from_pointee(ProviderSet::default()),
            update_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle.vehicle_type()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.current.load().updated_at
    }

    /// The active proxy set.
    pub fn proxies(&self) -> Arc<Vec<Arc<Proxy>>> {
        self.current.load().proxies.clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Proxy>> {
        self.proxies().iter().find(|p| p.name() == name).cloned()
    }

    /// Load the cached copy, falling back to a fetch. Never fails; problems
    /// are logged and the provider starts empty.
    pub async fn initialize(&self) {
        match self.load_cached().await {
            Ok(count) => {
                tracing::info!(provider = %self.name, proxies = count, "Provider loaded from cache");
                return;
            }
            Err(e) => {
                tracing::debug!(provider = %self.name, error = %e, "No usable provider cache");
            }
        }
        if let Err(e) = self.update().await {
            tracing::warn!(provider = %self.name, error = %e, "Initial provider update failed");
        }
    }

    /// Install the content of the vehicle's path without fetching.
    pub async fn load_cached(&self) -> Result<usize, ProviderError> {
        let path = self.vehicle.path();
        let content = vehicle::read_file(path).await?;
        let proxies = self.parse(&content)?;
        let count = proxies.len();

        let updated_at = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        self.current.store(Arc::new(ProviderSet {
            proxies: Arc::new(proxies),
            hash: Some(content_hash(&content)),
            updated_at: Some(updated_at),
        }));
        Ok(count)
    }

    /// Refresh from the vehicle. On any error the active set is kept.
    pub async fn update(&self) -> Result<UpdateOutcome, ProviderError> {
        let _guard = self.update_lock.lock().await;

        let outcome = self.fetch_and_swap().await;
        match &outcome {
            Ok(UpdateOutcome::Updated(count)) => {
                metrics::record_provider_update(&self.name, "updated");
                tracing::info!(provider = %self.name, proxies = count, "Provider updated");
            }
            Ok(UpdateOutcome::Unchanged) => {
                metrics::record_provider_update(&self.name, "unchanged");
                tracing::debug!(provider = %self.name, "Provider content unchanged");
            }
            Err(e) => {
                metrics::record_provider_update(&self.name, "failed");
                tracing::warn!(provider = %self.name, error = %e, "Provider update failed, keeping current set");
            }
        }
        outcome
    }

    async fn fetch_and_swap(&self) -> Result<UpdateOutcome, ProviderError> {
        let content = self.vehicle.read().await?;
        let hash = content_hash(&content);

        let current = self.current.load_full();
        if current.hash.as_deref() == Some(hash.as_str()) {
            self.current.store(Arc::new(ProviderSet {
                proxies: current.proxies.clone(),
                hash: current.hash.clone(),
                updated_at: Some(Utc::now()),
            }));
            return Ok(UpdateOutcome::Unchanged);
        }

        let proxies = self.parse(&content)?;
        self.vehicle.store(&content).await?;

        let count = proxies.len();
        self.current.store(Arc::new(ProviderSet {
            proxies: Arc::new(proxies),
            hash: Some(hash),
            updated_at: Some(Utc::now()),
        }));
        Ok(UpdateOutcome::Updated(count))
    }

    fn parse(&self, content: &[u8]) -> Result<Vec<Arc<Proxy>>, ProviderError> {
        let text = std::str::from_utf8(content).map_err(|_| ProviderError::Encoding)?;
        let payload: ProviderPayload = toml::from_str(text)?;

        let mut proxies: Vec<Arc<Proxy>> = Vec::with_capacity(payload.proxies.len());
        for config in &payload.proxies {
            if proxies.iter().any(|p| p.name() == config.name()) {
                tracing::warn!(provider = %self.name, proxy = %config.name(), "Duplicate proxy name in provider, skipped");
                continue;
            }
            proxies.push(Arc::new(Proxy::leaf(config)));
        }
        if proxies.is_empty() {
            return Err(ProviderError::Empty(self.name.clone()));
        }
        Ok(proxies)
    }

    /// Probe every member now and wait for the results.
    pub async fn check_all(&self) -> usize {
        check_all(&self.proxies(), &self.settings.probe, &self.dial).await
    }

    /// Probe every member in the background.
    pub fn health_check(self: &Arc<Self>) {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            provider.check_all().await;
        });
    }

    /// Start the refresh and health check loops for this epoch.
    pub fn spawn_background(self: &Arc<Self>, shutdown: &Shutdown) {
        if !self.settings.interval.is_zero() {
            tokio::spawn(Arc::clone(self).refresh_loop(shutdown.subscribe()));
        }
        if let Some(interval) = self.settings.health_interval {
            let monitor = HealthMonitor::new(
                HealthTarget::Provider(Arc::clone(self)),
                self.settings.probe.clone(),
                interval,
                self.dial.clone(),
            );
            tokio::spawn(monitor.run(shutdown.subscribe()));
        }
    }

    async fn refresh_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = self.settings.interval;
        let mut backoff = Backoff::new(RETRY_BASE, interval);
        let mut wait = interval;

        loop {
            tokio::select! {
                _ = time::sleep(wait) => {}
                _ = shutdown.recv() => {
                    tracing::debug!(provider = %self.name, "Provider refresh loop exiting");
                    break;
                }
            }

            wait = match self.update().await {
                Ok(outcome) => {
                    backoff.reset();
                    if outcome != UpdateOutcome::Unchanged && self.settings.health_interval.is_some() {
                        self.health_check();
                    }
                    interval
                }
                Err(_) => backoff.next_delay(),
            };
        }
    }
}

fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
