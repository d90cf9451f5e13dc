//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the tunnel.
//! All types derive Serde traits for deserialization from TOML; keys are
//! kebab-case and every section has defaults so minimal files work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::adapter::{Strategy, DEFAULT_TEST_URL};
use crate::observability::LogLevel;
use crate::tunnel::{InboundType, TunnelMode};

/// Root configuration document.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct TunnelConfig {
    /// HTTP proxy port (0 = disabled).
    pub port: u16,

    /// SOCKS proxy port (0 = disabled).
    pub socks_port: u16,

    /// Transparent redirect port (0 = disabled).
    pub redir_port: u16,

    /// TPROXY port (0 = disabled).
    pub tproxy_port: u16,

    /// Mixed HTTP/SOCKS port (0 = disabled).
    pub mixed_port: u16,

    /// Listen on all interfaces instead of loopback.
    pub allow_lan: bool,

    /// Address used for the port listeners when `allow-lan` is set; `*` means all.
    pub bind_address: String,

    pub mode: TunnelMode,

    pub log_level: LogLevel,

    /// Allow IPv6 results from the resolver.
    pub ipv6: bool,

    /// Dispatcher settings.
    pub tunnel: TunnelSettings,

    /// Defaults for group and provider health checks.
    pub health_check: HealthCheckConfig,

    /// Selection persistence.
    pub profile: ProfileConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Named listeners.
    pub inbounds: Vec<InboundConfig>,

    /// Leaf proxies.
    pub proxies: Vec<ProxyConfig>,

    /// Proxy groups, in declaration order.
    pub proxy_groups: Vec<ProxyGroupConfig>,

    /// Proxy providers keyed by name.
    pub proxy_providers: BTreeMap<String, ProviderConfig>,

    /// Rules in text form, evaluated top to bottom.
    pub rules: Vec<String>,
}

/// What to do with a connection no rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    #[default]
    Reject,
    Direct,
}

/// Dispatcher settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct TunnelSettings {
    /// Outbound connect deadline.
    pub dial_timeout_ms: u64,

    /// DNS lookup deadline.
    pub dns_timeout_ms: u64,

    pub unmatched: UnmatchedPolicy,

    /// How long shutdown waits for connections to finish on their own.
    pub shutdown_grace_secs: u64,

    /// Capacity of the queue between listeners and the dispatcher.
    pub queue_size: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 5_000,
            dns_timeout_ms: 5_000,
            unmatched: UnmatchedPolicy::Reject,
            shutdown_grace_secs: 10,
            queue_size: 1_024,
        }
    }
}

/// Health check defaults.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct HealthCheckConfig {
    /// Test URL used when a group or provider does not set one.
    pub url: String,

    /// Per-probe timeout.
    pub timeout_ms: u64,

    /// Interval used when a group or provider does not set one.
    pub interval_secs: u64,

    /// Consecutive failed probes before a proxy is considered dead.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TEST_URL.to_string(),
            timeout_ms: 5_000,
            interval_secs: 300,
            unhealthy_threshold: 1,
        }
    }
}

/// Selection persistence.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProfileConfig {
    /// Persist selector choices across restarts.
    pub store_selected: bool,

    /// Cache file, relative to the home directory.
    pub cache_file: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            store_selected: true,
            cache_file: "cache.json".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ObservabilityConfig {
    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// A named listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct InboundConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub inbound_type: InboundType,

    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    pub port: u16,

    /// Fixed destination (`host:port`) for `tunnel` inbounds.
    #[serde(default)]
    pub target: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

/// A leaf proxy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyConfig {
    Direct { name: String },
    Reject { name: String },
    Relay { name: String, server: String, port: u16 },
}

impl ProxyConfig {
    pub fn name(&self) -> &str {
        match self {
            ProxyConfig::Direct { name } | ProxyConfig::Reject { name } | ProxyConfig::Relay { name, .. } => name,
        }
    }
}

/// Group policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupType {
    Select,
    UrlTest,
    Fallback,
    LoadBalance,
}

/// A proxy group.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyGroupConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub group_type: GroupType,

    /// Static members: proxies, groups, `DIRECT` or `REJECT`.
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Providers whose proxies are appended after the static members.
    #[serde(default, rename = "use")]
    pub uses: Vec<String>,

    /// `|`-separated keywords applied to provider members.
    #[serde(default)]
    pub filter: Option<String>,

    /// Health check URL; defaults to `[health-check] url`.
    #[serde(default)]
    pub url: Option<String>,

    /// Health check interval in seconds; 0 disables it.
    #[serde(default)]
    pub interval: Option<u64>,

    /// URLTest only: keep the current choice unless beaten by more than this (ms).
    #[serde(default)]
    pub tolerance: u32,

    /// LoadBalance only.
    #[serde(default)]
    pub strategy: Strategy,
}

/// Where a provider gets its proxy list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleKind {
    File,
    Http,
}

/// A proxy provider.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub vehicle: VehicleKind,

    /// Source URL for `http` providers.
    #[serde(default)]
    pub url: Option<String>,

    /// Source file for `file` providers, cache file for `http` ones.
    /// Relative paths are resolved against the home directory.
    pub path: String,

    /// Refresh interval in seconds; 0 disables refresh.
    #[serde(default)]
    pub interval: u64,

    #[serde(default)]
    pub health_check: ProviderHealthCheck,
}

/// Provider health check settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProviderHealthCheck {
    pub enable: bool,

    pub url: Option<String>,

    /// Interval in seconds; defaults to `[health-check] interval-secs`.
    pub interval: Option<u64>,
}

/// Contents of a provider file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct ProviderPayload {
    pub proxies: Vec<ProxyConfig>,
}
