//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe the members of a group or provider
//! - Record results on each member through `Proxy::probe`

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::time;

use crate::adapter::{DialContext, ProbeOptions, Proxy};
use crate::provider::ProxyProvider;

/// Whose members a monitor probes.
#[derive(Debug, Clone)]
pub enum HealthTarget {
    Group(Arc<Proxy>),
    Provider(Arc<ProxyProvider>),
}

impl HealthTarget {
    pub fn name(&self) -> &str {
        match self {
            HealthTarget::Group(proxy) => proxy.name(),
            HealthTarget::Provider(provider) => provider.name(),
        }
    }

    pub fn members(&self) -> Vec<Arc<Proxy>> {
        match self {
            HealthTarget::Group(proxy) => proxy
                .group_members()
                .map(|m| m.resolve())
                .unwrap_or_default(),
            HealthTarget::Provider(provider) => provider.proxies().as_ref().clone(),
        }
    }
}

pub struct HealthMonitor {
    target: HealthTarget,
    options: ProbeOptions,
    interval: Duration,
    dial: DialContext,
}

impl HealthMonitor {
    pub fn new(target: HealthTarget, options: ProbeOptions, interval: Duration, dial: DialContext) -> Self {
        Self {
            target,
            options,
            interval,
            dial,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if self.interval.is_zero() {
            tracing::debug!(source = %self.target.name(), "Health check interval is zero, monitor disabled");
            return;
        }

        tracing::info!(
            source = %self.target.name(),
            interval_secs = self.interval.as_secs(),
            url = %self.options.url,
            "Health monitor starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let members = self.target.members();
                    check_all(&members, &self.options, &self.dial).await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!(source = %self.target.name(), "Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Probe every proxy concurrently. Returns how many are alive afterwards.
pub async fn check_all(proxies: &[Arc<Proxy>], options: &ProbeOptions, dial: &DialContext) -> usize {
    let probes = proxies.iter().map(|proxy| async move {
        if let Err(e) = proxy.probe(options, dial).await {
            tracing::warn!(proxy = %proxy.name(), error = %e, "Health check failed");
        }
    });
    join_all(probes).await;

    let alive = proxies.iter().filter(|p| p.is_alive()).count();
    tracing::debug!(total = proxies.len(), alive, "Health check round finished");
    alive
}
