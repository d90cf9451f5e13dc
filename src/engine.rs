//! Process-level owner of the tunnel.
//!
//! # Data Flow
//! ```text
//! main.rs / control façade
//!     → Engine
//!         apply_config  → ConfigState::build → Tunnel::apply
//!                         (force: ListenerManager recreate)
//!         patch_general → ConfigState::with_general → Tunnel::apply
//!         proxies / providers / connections / rules / inbounds / dns
//!     → report.rs shapes
//! ```
//!
//! # Design Decisions
//! - All process-wide state lives here; nothing is global
//! - Applies and patches are serialized so versions stay monotonic
//! - Only startup treats config and bind errors as fatal

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::adapter::{DelayReport, GroupError, ProbeError};
use crate::config::{load_config, parse_config, ConfigError, InboundConfig, TunnelConfig};
use crate::inbound::{Handshakes, InboundInfo, ListenerError, ListenerManager, Ports};
use crate::lifecycle::Shutdown;
use crate::observability::{metrics, LogError, LogHandle};
use crate::profile::SelectionCache;
use crate::provider::{ProviderError, UpdateOutcome};
use crate::report::{self, ProviderReport, ProxyReport};
use crate::resolver::{ResolveError, Resolver, SystemResolver};
use crate::rules::{CountryLookup, LanCountryLookup, RuleReport};
use crate::statistic::{ConnectionRegistry, RegistryError, RegistrySnapshot, Traffic};
use crate::tunnel::state::resolve_path;
use crate::tunnel::{BuildContext, ConfigState, GeneralPatch, GeneralSettings, Tunnel};

/// Error type for façade operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("no config file to reload")]
    NoConfigPath,

    #[error("invalid general option: {0}")]
    InvalidPatch(String),
}

fn not_found(kind: &'static str, name: &str) -> EngineError {
    EngineError::NotFound {
        kind,
        name: name.to_string(),
    }
}

/// Collaborators and paths the engine runs with.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// File re-read on reload requests without a payload.
    pub config_path: Option<PathBuf>,
    /// Base for relative provider and cache paths.
    pub home_dir: PathBuf,
    pub resolver: Arc<dyn Resolver>,
    pub geoip: Arc<dyn CountryLookup>,
    pub handshakes: Handshakes,
    /// Present when the process installed the global subscriber.
    pub log: Option<LogHandle>,
}

impl EngineOptions {
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_path: None,
            home_dir: home_dir.into(),
            resolver: Arc::new(SystemResolver),
            geoip: Arc::new(LanCountryLookup),
            handshakes: Handshakes::default(),
            log: None,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_log(mut self, log: LogHandle) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_handshakes(mut self, handshakes: Handshakes) -> Self {
        self.handshakes = handshakes;
        self
    }
}

/// The running tunnel and everything needed to control it.
#[derive(Debug)]
pub struct Engine {
    tunnel: Arc<Tunnel>,
    listeners: ListenerManager,
    selection: SelectionCache,
    options: EngineOptions,
    version: AtomicU64,
    apply_lock: Mutex<()>,
    dispatcher: Shutdown,
}

impl Engine {
    /// Build the first state, start dispatching and bind every listener.
    pub async fn start(config: TunnelConfig, options: EngineOptions) -> Result<Self, EngineError> {
        let selection = SelectionCache::open(
            resolve_path(&options.home_dir, &config.profile.cache_file),
            config.profile.store_selected,
        );
        let ctx = build_context(&options, &selection);
        let state = ConfigState::build(&config, &ctx, 1).await?;

        let (queue_tx, queue_rx) = mpsc::channel(config.tunnel.queue_size.max(1));
        let tunnel = Arc::new(Tunnel::new(state));
        tunnel.start();
        let dispatcher = Shutdown::new();
        tokio::spawn(tunnel.clone().run(queue_rx, dispatcher.subscribe()));

        let engine = Self {
            tunnel,
            listeners: ListenerManager::new(queue_tx, options.handshakes.clone()),
            selection,
            options,
            version: AtomicU64::new(1),
            apply_lock: Mutex::new(()),
            dispatcher,
        };

        engine.listeners.recreate_listeners(&config.inbounds).await?;
        let general = engine.general();
        engine
            .listeners
            .recreate_ports_listeners(Ports::from_general(&general), general.allow_lan, &general.bind_address)
            .await?;

        tracing::info!(
            mode = %general.mode,
            inbounds = engine.listeners.inbounds().await.len(),
            "Engine started"
        );
        Ok(engine)
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.tunnel.registry()
    }

    pub fn selection(&self) -> &SelectionCache {
        &self.selection
    }

    /// Replace routing state with one built from `config`.
    ///
    /// Only `force` rebinds listeners; established connections are never
    /// touched either way.
    pub async fn apply_config(&self, config: TunnelConfig, force: bool) -> Result<(), EngineError> {
        let _guard = self.apply_lock.lock().await;

        let version = self.version.load(Ordering::SeqCst) + 1;
        let ctx = build_context(&self.options, &self.selection);
        let state = match ConfigState::build(&config, &ctx, version).await {
            Ok(state) => state,
            Err(e) => {
                metrics::record_config_reload("failure");
                tracing::error!(error = %e, "Config rejected, keeping current state");
                return Err(e.into());
            }
        };
        let previous = self.tunnel.snapshot();
        let general = state.general().clone();
        if general.log_level != previous.general().log_level {
            if let Err(e) = self.set_log_level(&general) {
                metrics::record_config_reload("failure");
                return Err(e);
            }
        }

        self.version.store(version, Ordering::SeqCst);
        self.tunnel.apply(state);
        self.selection.set_persist(config.profile.store_selected);

        if force {
            if let Err(e) = self.listeners.recreate_listeners(&config.inbounds).await {
                tracing::error!(error = %e, "Inbound listeners not fully recreated");
            }
            if let Err(e) = self
                .listeners
                .recreate_ports_listeners(Ports::from_general(&general), general.allow_lan, &general.bind_address)
                .await
            {
                tracing::error!(error = %e, "Port listeners not fully recreated");
            }
        }
        metrics::record_config_reload("success");
        Ok(())
    }

    /// Re-read a config file (the startup one when `path` is `None`) and apply it.
    pub async fn update_config_from_path(&self, path: Option<&Path>, force: bool) -> Result<(), EngineError> {
        let path = path
            .or(self.options.config_path.as_deref())
            .ok_or(EngineError::NoConfigPath)?;
        let config = load_config(path).inspect_err(|_| metrics::record_config_reload("failure"))?;
        tracing::info!(path = %path.display(), force, "Reloading config");
        self.apply_config(config, force).await
    }

    /// Apply a config document given inline.
    pub async fn update_config_from_payload(&self, payload: &[u8], force: bool) -> Result<(), EngineError> {
        let config = parse_config(payload).inspect_err(|_| metrics::record_config_reload("failure"))?;
        self.apply_config(config, force).await
    }

    pub fn general(&self) -> GeneralSettings {
        self.tunnel.snapshot().general().clone()
    }

    /// Change general options without rebuilding routing.
    ///
    /// Port listeners and the log level are switched before the new state is
    /// installed; if either fails the previous port listeners are rebound and
    /// the state is untouched.
    pub async fn patch_general(&self, patch: GeneralPatch) -> Result<GeneralSettings, EngineError> {
        if let Some(addr) = patch.bind_address.as_deref() {
            if !matches!(addr, "*" | "") && addr.parse::<IpAddr>().is_err() {
                return Err(EngineError::InvalidPatch(format!("bind-address {}", addr)));
            }
        }
        let _guard = self.apply_lock.lock().await;

        let current = self.tunnel.snapshot();
        let general = patch.apply_to(current.general());
        if &general == current.general() {
            return Ok(general);
        }
        let previous = current.general();

        let rebind = general.ports_differ(previous);
        if rebind {
            if let Err(e) = self.bind_ports(&general).await {
                self.restore_ports(previous).await;
                return Err(e.into());
            }
        }
        if general.log_level != previous.log_level {
            if let Err(e) = self.set_log_level(&general) {
                if rebind {
                    self.restore_ports(previous).await;
                }
                return Err(e);
            }
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.tunnel.apply(current.with_general(general.clone(), version));
        Ok(general)
    }

    async fn bind_ports(&self, general: &GeneralSettings) -> Result<(), ListenerError> {
        self.listeners
            .recreate_ports_listeners(Ports::from_general(general), general.allow_lan, &general.bind_address)
            .await
    }

    async fn restore_ports(&self, general: &GeneralSettings) {
        if let Err(e) = self.bind_ports(general).await {
            tracing::error!(error = %e, "Previous port listeners not fully restored");
        }
    }

    fn set_log_level(&self, general: &GeneralSettings) -> Result<(), EngineError> {
        if let Some(log) = &self.options.log {
            log.set_level(general.log_level)?;
        }
        Ok(())
    }

    pub fn proxies(&self) -> BTreeMap<String, ProxyReport> {
        report::proxies(&self.tunnel.snapshot())
    }

    pub fn proxy(&self, name: &str) -> Result<ProxyReport, EngineError> {
        let state = self.tunnel.snapshot();
        let proxy = state.proxy(name).ok_or_else(|| not_found("proxy", name))?;
        Ok(ProxyReport::of(&proxy))
    }

    /// Pin a Selector member and remember the choice.
    pub fn select(&self, group: &str, member: &str) -> Result<(), EngineError> {
        let state = self.tunnel.snapshot();
        let proxy = state.proxy(group).ok_or_else(|| not_found("proxy", group))?;
        proxy.as_selector()?.set(group, member)?;
        self.selection.set_selected(group, member);
        Ok(())
    }

    /// Probe one proxy or group now.
    pub async fn delay_test(
        &self,
        name: &str,
        url: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<DelayReport, EngineError> {
        let state = self.tunnel.snapshot();
        let proxy = state.proxy(name).ok_or_else(|| not_found("proxy", name))?;
        let options = state.probe_options(url, timeout)?;
        Ok(proxy.probe(&options, &state.dial()).await?)
    }

    pub fn providers(&self) -> BTreeMap<String, ProviderReport> {
        report::providers(&self.tunnel.snapshot())
    }

    pub fn provider(&self, name: &str) -> Result<ProviderReport, EngineError> {
        let provider = self
            .tunnel
            .snapshot()
            .provider(name)
            .ok_or_else(|| not_found("provider", name))?;
        Ok(ProviderReport::of(&provider))
    }

    pub async fn update_provider(&self, name: &str) -> Result<UpdateOutcome, EngineError> {
        let provider = self
            .tunnel
            .snapshot()
            .provider(name)
            .ok_or_else(|| not_found("provider", name))?;
        Ok(provider.update().await?)
    }

    /// Start probing every member of a provider; returns without waiting.
    pub fn health_check_provider(&self, name: &str) -> Result<(), EngineError> {
        let provider = self
            .tunnel
            .snapshot()
            .provider(name)
            .ok_or_else(|| not_found("provider", name))?;
        provider.health_check();
        Ok(())
    }

    pub fn provider_proxy(&self, provider: &str, name: &str) -> Result<ProxyReport, EngineError> {
        let state = self.tunnel.snapshot();
        let provider = state.provider(provider).ok_or_else(|| not_found("provider", provider))?;
        let proxy = provider.get(name).ok_or_else(|| not_found("proxy", name))?;
        Ok(ProxyReport::of(&proxy))
    }

    pub async fn provider_proxy_delay(
        &self,
        provider: &str,
        name: &str,
        url: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<DelayReport, EngineError> {
        let state = self.tunnel.snapshot();
        let provider = state.provider(provider).ok_or_else(|| not_found("provider", provider))?;
        let proxy = provider.get(name).ok_or_else(|| not_found("proxy", name))?;
        let options = state.probe_options(url, timeout)?;
        Ok(proxy.probe(&options, &state.dial()).await?)
    }

    pub fn connections(&self) -> RegistrySnapshot {
        self.registry().snapshot()
    }

    pub fn close_connection(&self, id: Uuid) -> Result<(), EngineError> {
        Ok(self.registry().close(id)?)
    }

    pub fn close_all_connections(&self) -> usize {
        self.registry().close_all()
    }

    pub fn traffic(&self) -> Traffic {
        self.registry().traffic()
    }

    pub fn rules(&self) -> Vec<RuleReport> {
        self.tunnel.snapshot().rules().report()
    }

    pub async fn inbounds(&self) -> Vec<InboundInfo> {
        self.listeners.inbounds().await
    }

    /// Replace the named inbound listeners.
    pub async fn update_inbounds(&self, inbounds: &[InboundConfig]) -> Result<(), EngineError> {
        Ok(self.listeners.recreate_listeners(inbounds).await?)
    }

    /// Look a name up through the tunnel's resolver.
    pub async fn dns_query(&self, name: &str) -> Result<Vec<IpAddr>, EngineError> {
        let dial = self.tunnel.snapshot().dial();
        match tokio::time::timeout(dial.dns_timeout, dial.resolver.lookup(name, dial.ipv6)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ResolveError::Timeout(name.to_string()).into()),
        }
    }

    /// Stop accepting, drain for the grace period, then close the rest.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.tunnel.snapshot().settings().shutdown_grace_secs);
        tracing::info!(grace_secs = grace.as_secs(), "Shutting down");

        self.listeners.stop_all().await;
        self.dispatcher.trigger();
        let closed = self.tunnel.shutdown(grace).await;

        if let Err(e) = self.selection.save_to_file() {
            tracing::warn!(error = %e, "Failed to save selection cache");
        }
        tracing::info!(forced = closed, "Shutdown complete");
    }
}

fn build_context(options: &EngineOptions, selection: &SelectionCache) -> BuildContext {
    BuildContext {
        resolver: options.resolver.clone(),
        geoip: options.geoip.clone(),
        selection: selection.clone(),
        home_dir: options.home_dir.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine(doc: &str) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config(doc.as_bytes()).unwrap();
        let engine = Engine::start(config, EngineOptions::new(dir.path())).await.unwrap();
        (engine, dir)
    }

    const DOC: &str = r#"
        rules = ["MATCH,Proxy"]

        [[proxy-groups]]
        name = "Proxy"
        type = "select"
        proxies = ["DIRECT", "REJECT"]
    "#;

    #[tokio::test]
    async fn select_validates_and_persists() {
        let (engine, dir) = engine(DOC).await;
        engine.select("Proxy", "REJECT").unwrap();
        assert_eq!(engine.proxy("Proxy").unwrap().now.as_deref(), Some("REJECT"));
        assert_eq!(engine.selection().get_selected("Proxy").as_deref(), Some("REJECT"));
        assert!(dir.path().join("cache.json").exists());

        let err = engine.select("Proxy", "nope").unwrap_err();
        assert!(matches!(err, EngineError::Group(GroupError::UnknownMember { .. })));
        let err = engine.select("DIRECT", "REJECT").unwrap_err();
        assert!(matches!(err, EngineError::Group(GroupError::NotSelector(_))));
        let err = engine.select("Missing", "REJECT").unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "proxy", .. }));
    }

    #[tokio::test]
    async fn patch_bumps_version_and_keeps_routing() {
        let (engine, _dir) = engine(DOC).await;
        let before = engine.tunnel().snapshot();
        let patch: GeneralPatch = serde_json::from_str(r#"{"mode":"direct"}"#).unwrap();
        let general = engine.patch_general(patch).await.unwrap();
        assert_eq!(general.mode, crate::tunnel::TunnelMode::Direct);

        let after = engine.tunnel().snapshot();
        assert_eq!(after.version(), before.version() + 1);
        assert!(after.shares_routing(&before));

        let bad: GeneralPatch = serde_json::from_str(r#"{"bind-address":"not-an-ip"}"#).unwrap();
        assert!(matches!(engine.patch_general(bad).await, Err(EngineError::InvalidPatch(_))));
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn engine_with_mixed(doc: &str) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config(doc.as_bytes()).unwrap();
        let handshakes = Handshakes::default().register(
            crate::tunnel::InboundType::Mixed,
            Arc::new(crate::inbound::TunnelHandshake),
        );
        let options = EngineOptions::new(dir.path()).with_handshakes(handshakes);
        (Engine::start(config, options).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn patch_to_taken_port_changes_nothing() {
        let (engine, _dir) = engine_with_mixed(DOC).await;
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let before = engine.tunnel().snapshot();

        let patch: GeneralPatch =
            serde_json::from_str(&format!(r#"{{"mixed-port":{},"mode":"direct"}}"#, port)).unwrap();
        let err = engine.patch_general(patch).await.unwrap_err();
        assert!(matches!(err, EngineError::Listener(ListenerError::Bind { .. })));

        let after = engine.tunnel().snapshot();
        assert_eq!(after.version(), before.version());
        assert_eq!(engine.general(), *before.general());
        assert!(engine.inbounds().await.is_empty());
    }

    #[tokio::test]
    async fn failed_port_patch_restores_previous_listener() {
        let old_port = free_port();
        let doc = format!("mixed-port = {}\n{}", old_port, DOC);
        let (engine, _dir) = engine_with_mixed(&doc).await;
        assert_eq!(engine.inbounds().await[0].port, old_port);

        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let patch: GeneralPatch = serde_json::from_str(&format!(r#"{{"mixed-port":{}}}"#, port)).unwrap();
        assert!(engine.patch_general(patch).await.is_err());

        assert_eq!(engine.general().mixed_port, old_port);
        let inbounds = engine.inbounds().await;
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0].name, "DEFAULT-MIXED");
        assert_eq!(inbounds[0].port, old_port);
    }

    #[tokio::test]
    async fn store_selected_can_be_switched_on_by_reload() {
        let doc = DOC.replacen(
            "rules = [\"MATCH,Proxy\"]\n",
            "rules = [\"MATCH,Proxy\"]\n[profile]\nstore-selected = false\n",
            1,
        );
        let (engine, dir) = engine(&doc).await;
        let cache = dir.path().join("cache.json");

        engine.select("Proxy", "REJECT").unwrap();
        assert!(!cache.exists());

        engine.update_config_from_payload(DOC.as_bytes(), false).await.unwrap();
        engine.select("Proxy", "DIRECT").unwrap();
        assert!(cache.exists());
        assert_eq!(
            SelectionCache::load_from_file(&cache).get_selected("Proxy").as_deref(),
            Some("DIRECT")
        );
    }

    #[tokio::test]
    async fn invalid_reload_keeps_state() {
        let (engine, _dir) = engine(DOC).await;
        let err = engine
            .update_config_from_payload(br#"rules = ["MATCH,Gone"]"#, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::Validation(_))));
        assert_eq!(engine.tunnel().snapshot().version(), 1);
        assert_eq!(engine.rules()[0].proxy, "Proxy");
    }

    #[tokio::test]
    async fn reload_without_path_is_an_error() {
        let (engine, _dir) = engine(DOC).await;
        assert!(matches!(
            engine.update_config_from_path(None, true).await,
            Err(EngineError::NoConfigPath)
        ));
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let (engine, _dir) = engine(DOC).await;
        assert!(matches!(engine.provider("p"), Err(EngineError::NotFound { kind: "provider", .. })));
        assert!(matches!(engine.close_connection(Uuid::new_v4()), Err(EngineError::Registry(_))));
        assert!(engine.proxies().contains_key("GLOBAL"));
        assert_eq!(engine.close_all_connections(), 0);
    }

    #[tokio::test]
    async fn dns_query_answers_literals() {
        let (engine, _dir) = engine(DOC).await;
        let answer = engine.dns_query("127.0.0.1").await.unwrap();
        assert_eq!(answer, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
