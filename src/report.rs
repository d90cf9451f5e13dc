//! JSON shapes served to control clients.
//!
//! Field names follow the control API clients already speak, hence the
//! camelCase renames.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapter::{DelayRecord, Proxy, ProxyType};
use crate::provider::{ProxyProvider, VehicleType};
use crate::tunnel::ConfigState;

/// One proxy or group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyReport {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    pub delay: u32,
    #[serde(rename = "meanDelay")]
    pub mean_delay: u32,
    pub alive: bool,
    pub history: Vec<DelayRecord>,
    /// Member names, for groups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<String>>,
    /// Member currently in use, for groups that have one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,
}

impl ProxyReport {
    pub fn of(proxy: &Proxy) -> Self {
        let delays = proxy.health().delays();
        Self {
            name: proxy.name().to_string(),
            proxy_type: proxy.proxy_type(),
            delay: delays.delay,
            mean_delay: delays.mean_delay,
            alive: proxy.is_alive(),
            history: proxy.health().history(),
            all: proxy.group_members().map(|m| m.names()),
            now: proxy.now(),
        }
    }
}

/// Every proxy and group of a state, by name.
pub fn proxies(state: &ConfigState) -> BTreeMap<String, ProxyReport> {
    state
        .proxies()
        .iter()
        .map(|(name, proxy)| (name.clone(), ProxyReport::of(proxy)))
        .collect()
}

/// Kind tag of a provider; only proxy providers exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProviderKind {
    Proxy,
}

/// One provider with its current proxies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderReport {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(rename = "vehicleType")]
    pub vehicle_type: VehicleType,
    pub proxies: Vec<ProxyReport>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProviderReport {
    pub fn of(provider: &ProxyProvider) -> Self {
        Self {
            name: provider.name().to_string(),
            kind: ProviderKind::Proxy,
            vehicle_type: provider.vehicle_type(),
            proxies: provider.proxies().iter().map(|p| ProxyReport::of(p)).collect(),
            updated_at: provider.updated_at(),
        }
    }
}

pub fn providers(state: &ConfigState) -> BTreeMap<String, ProviderReport> {
    state
        .providers()
        .iter()
        .map(|(name, provider)| (name.clone(), ProviderReport::of(provider)))
        .collect()
}
