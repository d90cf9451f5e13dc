//! Immutable routing snapshot.
//!
//! # Responsibilities
//! - Build proxies, groups, providers and rules from a validated config
//! - Restore persisted Selector choices
//! - Own the background health and refresh loops of one config epoch
//!
//! # Design Decisions
//! - Groups are built in dependency order so members always exist first
//! - `GLOBAL` is an implicit Selector over every proxy and group
//! - A general-options patch makes a new state that shares the routing
//!   table, so probes and providers keep running across it

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::adapter::{
    DialContext, Fallback, GroupMembers, LoadBalance, NameFilter, ProbeOptions, Proxy, ProxyKind, Selector, UrlTest,
    GLOBAL,
};
use crate::config::schema::{
    GroupType, HealthCheckConfig, InboundConfig, ProviderConfig, ProxyGroupConfig, TunnelConfig, TunnelSettings,
    VehicleKind,
};
use crate::config::validation::group_order;
use crate::config::{validate_config, ConfigError, ValidationError};
use crate::health::{HealthMonitor, HealthTarget};
use crate::lifecycle::Shutdown;
use crate::observability::LogLevel;
use crate::profile::SelectionCache;
use crate::provider::{ProviderSettings, ProxyProvider, Vehicle};
use crate::resolver::Resolver;
use crate::rules::{CountryLookup, RuleSet};
use crate::tunnel::TunnelMode;

/// Options reported and patched through the general endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralSettings {
    pub port: u16,
    pub socks_port: u16,
    pub redir_port: u16,
    pub tproxy_port: u16,
    pub mixed_port: u16,
    pub allow_lan: bool,
    pub bind_address: String,
    pub mode: TunnelMode,
    pub log_level: LogLevel,
    pub ipv6: bool,
}

impl GeneralSettings {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            port: config.port,
            socks_port: config.socks_port,
            redir_port: config.redir_port,
            tproxy_port: config.tproxy_port,
            mixed_port: config.mixed_port,
            allow_lan: config.allow_lan,
            bind_address: if config.bind_address.is_empty() {
                "*".to_string()
            } else {
                config.bind_address.clone()
            },
            mode: config.mode,
            log_level: config.log_level,
            ipv6: config.ipv6,
        }
    }

    /// True when any port-listener setting differs.
    pub fn ports_differ(&self, other: &GeneralSettings) -> bool {
        self.port != other.port
            || self.socks_port != other.socks_port
            || self.redir_port != other.redir_port
            || self.tproxy_port != other.tproxy_port
            || self.mixed_port != other.mixed_port
            || self.allow_lan != other.allow_lan
            || self.bind_address != other.bind_address
    }
}

/// Partial update of the general options. Absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GeneralPatch {
    pub port: Option<u16>,
    pub socks_port: Option<u16>,
    pub redir_port: Option<u16>,
    pub tproxy_port: Option<u16>,
    pub mixed_port: Option<u16>,
    pub allow_lan: Option<bool>,
    pub bind_address: Option<String>,
    pub mode: Option<TunnelMode>,
    pub log_level: Option<LogLevel>,
    pub ipv6: Option<bool>,
}

impl GeneralPatch {
    pub fn apply_to(&self, general: &GeneralSettings) -> GeneralSettings {
        GeneralSettings {
            port: self.port.unwrap_or(general.port),
            socks_port: self.socks_port.unwrap_or(general.socks_port),
            redir_port: self.redir_port.unwrap_or(general.redir_port),
            tproxy_port: self.tproxy_port.unwrap_or(general.tproxy_port),
            mixed_port: self.mixed_port.unwrap_or(general.mixed_port),
            allow_lan: self.allow_lan.unwrap_or(general.allow_lan),
            bind_address: self.bind_address.clone().unwrap_or_else(|| general.bind_address.clone()),
            mode: self.mode.unwrap_or(general.mode),
            log_level: self.log_level.unwrap_or(general.log_level),
            ipv6: self.ipv6.unwrap_or(general.ipv6),
        }
    }
}

/// External collaborators a state is built with.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub resolver: Arc<dyn Resolver>,
    pub geoip: Arc<dyn CountryLookup>,
    pub selection: SelectionCache,
    /// Base for relative provider paths.
    pub home_dir: PathBuf,
}

/// Everything a config epoch routes with.
#[derive(Debug)]
pub struct RoutingTable {
    rules: RuleSet,
    proxies: HashMap<String, Arc<Proxy>>,
    providers: BTreeMap<String, Arc<ProxyProvider>>,
    group_checks: Vec<(Arc<Proxy>, ProbeOptions, Duration)>,
    settings: TunnelSettings,
    health: HealthCheckConfig,
    inbounds: Vec<InboundConfig>,
    dial: DialContext,
    background: Shutdown,
}

impl RoutingTable {
    /// Start group health checks and provider loops for this epoch.
    pub fn start_background(&self) {
        for (group, options, interval) in &self.group_checks {
            let monitor = HealthMonitor::new(
                HealthTarget::Group(group.clone()),
                options.clone(),
                *interval,
                self.dial.clone(),
            );
            tokio::spawn(monitor.run(self.background.subscribe()));
        }
        for provider in self.providers.values() {
            provider.spawn_background(&self.background);
        }
    }

    /// Stop every background loop of this epoch.
    pub fn stop_background(&self) {
        self.background.trigger();
    }
}

/// Versioned, immutable snapshot the dispatcher routes against.
#[derive(Debug, Clone)]
pub struct ConfigState {
    version: u64,
    general: GeneralSettings,
    routing: Arc<RoutingTable>,
}

impl ConfigState {
    /// Build a state from `config`. Providers are loaded before returning.
    pub async fn build(config: &TunnelConfig, ctx: &BuildContext, version: u64) -> Result<Self, ConfigError> {
        validate_config(config).map_err(ConfigError::Validation)?;

        let dial = DialContext {
            resolver: ctx.resolver.clone(),
            ipv6: config.ipv6,
            dns_timeout: Duration::from_millis(config.tunnel.dns_timeout_ms),
        };

        let mut proxies: HashMap<String, Arc<Proxy>> = HashMap::new();
        let mut global_members = vec![Arc::new(Proxy::direct()), Arc::new(Proxy::reject())];
        for proxy in &global_members {
            proxies.insert(proxy.name().to_string(), proxy.clone());
        }
        for leaf in &config.proxies {
            let proxy = Arc::new(Proxy::leaf(leaf));
            global_members.push(proxy.clone());
            proxies.insert(proxy.name().to_string(), proxy);
        }

        let providers = build_providers(config, ctx, &dial).await?;

        let order = group_order(&config.proxy_groups)
            .map_err(|cycle| ConfigError::Validation(vec![ValidationError::GroupCycle(cycle)]))?;
        let mut group_checks = Vec::new();
        for index in order {
            let group_config = &config.proxy_groups[index];
            let group = Arc::new(build_group(group_config, &proxies, &providers)?);
            if let ProxyKind::Selector(selector) = group.kind() {
                restore_selection(ctx, group.name(), selector);
            }
            if let Some(check) = group_check(group_config, &config.health_check)? {
                group_checks.push((group.clone(), check.0, check.1));
            }
            proxies.insert(group.name().to_string(), group);
        }
        // GLOBAL lists groups in declaration order, after the leaves.
        for group_config in &config.proxy_groups {
            if let Some(group) = proxies.get(&group_config.name) {
                global_members.push(group.clone());
            }
        }
        let global = Selector::new(GroupMembers::from_proxies(global_members));
        restore_selection(ctx, GLOBAL, &global);
        proxies.insert(GLOBAL.to_string(), Arc::new(Proxy::new(GLOBAL, ProxyKind::Selector(global))));

        let rules = RuleSet::parse(&config.rules, &ctx.geoip).map_err(|errors| {
            ConfigError::Validation(
                errors
                    .into_iter()
                    .map(|(index, e)| ValidationError::InvalidRule {
                        index,
                        line: config.rules[index].clone(),
                        reason: e.to_string(),
                    })
                    .collect(),
            )
        })?;

        tracing::info!(
            version,
            proxies = proxies.len(),
            providers = providers.len(),
            rules = rules.len(),
            "Config state built"
        );

        Ok(Self {
            version,
            general: GeneralSettings::from_config(config),
            routing: Arc::new(RoutingTable {
                rules,
                proxies,
                providers,
                group_checks,
                settings: config.tunnel.clone(),
                health: config.health_check.clone(),
                inbounds: config.inbounds.clone(),
                dial,
                background: Shutdown::new(),
            }),
        })
    }

    /// Same routing, new general options.
    pub fn with_general(&self, general: GeneralSettings, version: u64) -> Self {
        Self {
            version,
            general,
            routing: self.routing.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn general(&self) -> &GeneralSettings {
        &self.general
    }

    pub fn mode(&self) -> TunnelMode {
        self.general.mode
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn shares_routing(&self, other: &ConfigState) -> bool {
        Arc::ptr_eq(&self.routing, &other.routing)
    }

    pub fn rules(&self) -> &RuleSet {
        &self.routing.rules
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.routing.settings
    }

    pub fn health_check(&self) -> &HealthCheckConfig {
        &self.routing.health
    }

    pub fn inbounds(&self) -> &[InboundConfig] {
        &self.routing.inbounds
    }

    /// Dial settings, with the IPv6 flag taken from the general options.
    pub fn dial(&self) -> DialContext {
        DialContext {
            ipv6: self.general.ipv6,
            ..self.routing.dial.clone()
        }
    }

    pub fn proxy(&self, name: &str) -> Option<Arc<Proxy>> {
        self.routing.proxies.get(name).cloned()
    }

    pub fn proxies(&self) -> &HashMap<String, Arc<Proxy>> {
        &self.routing.proxies
    }

    pub fn provider(&self, name: &str) -> Option<Arc<ProxyProvider>> {
        self.routing.providers.get(name).cloned()
    }

    pub fn providers(&self) -> &BTreeMap<String, Arc<ProxyProvider>> {
        &self.routing.providers
    }

    /// Probe options for an on-demand delay test.
    pub fn probe_options(&self, url: Option<&str>, timeout: Option<Duration>) -> Result<ProbeOptions, crate::adapter::ProbeError> {
        let health = &self.routing.health;
        ProbeOptions::new(
            url.unwrap_or(&health.url),
            timeout.unwrap_or(Duration::from_millis(health.timeout_ms)),
        )
        .map(|o| o.with_threshold(health.unhealthy_threshold))
    }
}

fn restore_selection(ctx: &BuildContext, group: &str, selector: &Selector) {
    if let Some(member) = ctx.selection.get_selected(group) {
        match selector.set(group, &member) {
            Ok(()) => tracing::debug!(group = %group, member = %member, "Restored selection"),
            Err(e) => tracing::debug!(group = %group, error = %e, "Stored selection no longer applies"),
        }
    }
}

async fn build_providers(
    config: &TunnelConfig,
    ctx: &BuildContext,
    dial: &DialContext,
) -> Result<BTreeMap<String, Arc<ProxyProvider>>, ConfigError> {
    let mut providers = BTreeMap::new();
    for (name, provider_config) in &config.proxy_providers {
        let provider = build_provider(name, provider_config, &config.health_check, &ctx.home_dir, dial)?;
        providers.insert(name.clone(), Arc::new(provider));
    }
    join_all(providers.values().map(|p| p.initialize())).await;
    Ok(providers)
}

fn build_provider(
    name: &str,
    config: &ProviderConfig,
    defaults: &HealthCheckConfig,
    home_dir: &Path,
    dial: &DialContext,
) -> Result<ProxyProvider, ConfigError> {
    let invalid = |reason: String| {
        ConfigError::Validation(vec![ValidationError::InvalidProvider {
            name: name.to_string(),
            reason,
        }])
    };

    let path = resolve_path(home_dir, &config.path);
    let vehicle = match config.vehicle {
        VehicleKind::File => Vehicle::file(path),
        VehicleKind::Http => {
            let url = config.url.as_deref().ok_or_else(|| invalid("http provider needs a url".into()))?;
            Vehicle::http(url, path).map_err(|e| invalid(e.to_string()))?
        }
    };

    let url = config.health_check.url.as_deref().unwrap_or(&defaults.url);
    let probe = ProbeOptions::new(url, Duration::from_millis(defaults.timeout_ms))
        .map_err(|e| invalid(e.to_string()))?
        .with_threshold(defaults.unhealthy_threshold);
    let health_interval = config
        .health_check
        .enable
        .then(|| Duration::from_secs(config.health_check.interval.unwrap_or(defaults.interval_secs)))
        .filter(|d| !d.is_zero());

    let settings = ProviderSettings {
        interval: Duration::from_secs(config.interval),
        probe,
        health_interval,
    };
    Ok(ProxyProvider::new(name, vehicle, settings, dial.clone()))
}

fn build_group(
    config: &ProxyGroupConfig,
    proxies: &HashMap<String, Arc<Proxy>>,
    providers: &BTreeMap<String, Arc<ProxyProvider>>,
) -> Result<Proxy, ConfigError> {
    let mut members = Vec::with_capacity(config.proxies.len());
    for name in &config.proxies {
        let proxy = proxies.get(name).ok_or_else(|| {
            ConfigError::Validation(vec![ValidationError::UnknownMember {
                group: config.name.clone(),
                member: name.clone(),
            }])
        })?;
        members.push(proxy.clone());
    }
    let mut used = Vec::with_capacity(config.uses.len());
    for name in &config.uses {
        let provider = providers.get(name).ok_or_else(|| {
            ConfigError::Validation(vec![ValidationError::UnknownProvider {
                group: config.name.clone(),
                provider: name.clone(),
            }])
        })?;
        used.push(provider.clone());
    }
    let filter = config.filter.as_deref().and_then(NameFilter::parse);
    let members = GroupMembers::new(members, used, filter);

    let kind = match config.group_type {
        GroupType::Select => ProxyKind::Selector(Selector::new(members)),
        GroupType::UrlTest => ProxyKind::UrlTest(UrlTest::new(members, config.tolerance)),
        GroupType::Fallback => ProxyKind::Fallback(Fallback::new(members)),
        GroupType::LoadBalance => ProxyKind::LoadBalance(LoadBalance::new(members, config.strategy)),
    };
    Ok(Proxy::new(config.name.clone(), kind))
}

/// Health check settings for a group, if it runs one.
///
/// Automatic groups check at the default interval unless told otherwise;
/// selectors only when an interval is given.
fn group_check(
    config: &ProxyGroupConfig,
    defaults: &HealthCheckConfig,
) -> Result<Option<(ProbeOptions, Duration)>, ConfigError> {
    let interval = match (config.interval, config.group_type) {
        (Some(secs), _) => secs,
        (None, GroupType::Select) => 0,
        (None, _) => defaults.interval_secs,
    };
    if interval == 0 {
        return Ok(None);
    }
    let url = config.url.as_deref().unwrap_or(&defaults.url);
    let options = ProbeOptions::new(url, Duration::from_millis(defaults.timeout_ms))
        .map_err(|_| {
            ConfigError::Validation(vec![ValidationError::InvalidUrl {
                owner: format!("group {}", config.name),
                url: url.to_string(),
            }])
        })?
        .with_threshold(defaults.unhealthy_threshold);
    Ok(Some((options, Duration::from_secs(interval))))
}

/// `path` as is when absolute, otherwise under `home_dir`.
pub(crate) fn resolve_path(home_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home_dir.join(path)
    }
}
