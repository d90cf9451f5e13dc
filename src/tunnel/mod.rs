//! Connection dispatcher.
//!
//! # Data Flow
//! ```text
//! ListenerManager ──(bounded queue)──▶ Tunnel::run
//!     → spawn Tunnel::handle per connection
//!         Accepted
//!         → Resolving   (capture ConfigState once, pre-resolve, match rule)
//!         → Connecting  (Proxy::connect bounded by dial-timeout)
//!         → Established (register, pump both directions)
//!         → Closing     (peer close, I/O error, close-by-id or shutdown)
//!         → Closed      (TrackedStream dropped, record unregistered)
//!       Failed from Resolving or Connecting closes the inbound stream
//! ```
//!
//! # Design Decisions
//! - Each connection reads the state pointer exactly once; a reload never
//!   changes the proxy of a connection already past Resolving
//! - Rule matching is pure; DNS happens before it, bounded by dns-timeout
//! - Teardown runs once, through the Drop of the tracked stream

pub mod metadata;
pub mod mode;
pub mod state;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::adapter::{BoxedStream, DialError, Proxy, DIRECT, GLOBAL};
use crate::config::UnmatchedPolicy;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resolver::resolve_with_timeout;
use crate::rules::RuleType;
use crate::statistic::{ConnectionRegistry, TrackedStream};

pub use metadata::{normalize_host, split_host_port, InboundType, Metadata, Network};
pub use mode::TunnelMode;
pub use state::{BuildContext, ConfigState, GeneralPatch, GeneralSettings, RoutingTable};

/// Error type for routing a connection to a proxy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no rule matched {0}")]
    NoMatch(String),

    #[error("rule target {0} does not exist")]
    UnknownTarget(String),
}

/// Lifecycle of one dispatched connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Resolving,
    Connecting,
    Established,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An accepted inbound connection with its routing facts.
pub struct InboundConn {
    pub stream: BoxedStream,
    pub metadata: Metadata,
}

impl fmt::Debug for InboundConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundConn").field("metadata", &self.metadata).finish_non_exhaustive()
    }
}

/// Where a connection is sent and which rule sent it there.
#[derive(Debug, Clone)]
pub struct Route {
    pub proxy: Arc<Proxy>,
    pub rule: Option<RuleType>,
    pub payload: String,
}

impl Route {
    fn to(proxy: Arc<Proxy>) -> Self {
        Self {
            proxy,
            rule: None,
            payload: String::new(),
        }
    }
}

/// The dispatcher. Holds the current [`ConfigState`] and the registry.
#[derive(Debug)]
pub struct Tunnel {
    state: ArcSwap<ConfigState>,
    registry: Arc<ConnectionRegistry>,
    background: Shutdown,
}

impl Tunnel {
    pub fn new(state: ConfigState) -> Self {
        Self {
            state: ArcSwap::from_pointee(state),
            registry: Arc::new(ConnectionRegistry::new()),
            background: Shutdown::new(),
        }
    }

    /// Start the rate ticker and the background loops of the current state.
    pub fn start(&self) {
        tokio::spawn(self.registry.clone().run_rate_ticker(self.background.subscribe()));
        self.state.load().routing().start_background();
    }

    pub fn snapshot(&self) -> Arc<ConfigState> {
        self.state.load_full()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Swap in a new state. Only new connections see it.
    ///
    /// When the routing table changes, the new epoch's background loops are
    /// started and the old epoch's are stopped.
    pub fn apply(&self, state: ConfigState) {
        let version = state.version();
        let next = Arc::new(state);
        let previous = self.state.swap(next.clone());
        if !previous.shares_routing(&next) {
            next.routing().start_background();
            previous.routing().stop_background();
        }
        tracing::info!(
            from = previous.version(),
            to = version,
            mode = %next.mode(),
            "Config state applied"
        );
    }

    /// Pick the proxy for `metadata` under `state`. Pure.
    pub fn route(state: &ConfigState, metadata: &Metadata) -> Result<Route, ResolutionError> {
        let lookup = |name: &str| {
            state
                .proxy(name)
                .ok_or_else(|| ResolutionError::UnknownTarget(name.to_string()))
        };
        match state.mode() {
            TunnelMode::Direct => lookup(DIRECT).map(Route::to),
            TunnelMode::Global => lookup(GLOBAL).map(Route::to),
            TunnelMode::Rule => {
                let rule = state
                    .rules()
                    .resolve(metadata)
                    .ok_or_else(|| ResolutionError::NoMatch(metadata.remote_address()))?;
                Ok(Route {
                    proxy: lookup(rule.target())?,
                    rule: Some(rule.rule_type()),
                    payload: rule.payload(),
                })
            }
        }
    }

    /// Fill in the destination IP when a rule needs one.
    ///
    /// A lookup failure leaves the metadata unchanged; IP rules then simply
    /// do not match.
    async fn pre_resolve(state: &ConfigState, metadata: &mut Metadata) {
        if state.mode() != TunnelMode::Rule || !state.rules().needs_ip() || !metadata.needs_resolve() {
            return;
        }
        let dial = state.dial();
        match resolve_with_timeout(dial.resolver.as_ref(), &metadata.host, dial.ipv6, dial.dns_timeout).await {
            Ok(ip) => metadata.dst_ip = Some(ip),
            Err(e) => tracing::warn!(host = %metadata.host, error = %e, "Pre-resolve failed, matching without IP"),
        }
    }

    /// Drive one connection from accept to close.
    pub async fn handle(self: Arc<Self>, conn: InboundConn) {
        let InboundConn { stream, mut metadata } = conn;
        transition(&metadata, ConnState::Accepted, ConnState::Resolving);

        let state = self.state.load_full();
        Self::pre_resolve(&state, &mut metadata).await;

        let route = match Self::route(&state, &metadata) {
            Ok(route) => route,
            Err(ResolutionError::NoMatch(_)) if state.settings().unmatched == UnmatchedPolicy::Direct => {
                match state.proxy(DIRECT) {
                    Some(direct) => Route::to(direct),
                    None => return,
                }
            }
            Err(e) => {
                tracing::info!(conn = %metadata, error = %e, "Connection not routed");
                metrics::record_connection("none", "unrouted");
                transition(&metadata, ConnState::Resolving, ConnState::Failed);
                return;
            }
        };
        let rule_label = route
            .rule
            .map(|r| r.to_string())
            .unwrap_or_else(|| state.mode().to_string());
        transition(&metadata, ConnState::Resolving, ConnState::Connecting);

        let dial = state.dial();
        let timeout = Duration::from_millis(state.settings().dial_timeout_ms);
        let connected = match time::timeout(timeout, route.proxy.connect(&metadata, &dial)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout(route.proxy.name().to_string())),
        };
        let upstream = match connected {
            Ok(upstream) => upstream,
            Err(e) => {
                match &e {
                    DialError::Rejected(_) => tracing::debug!(conn = %metadata, proxy = %route.proxy.name(), "Connection rejected"),
                    _ => tracing::warn!(conn = %metadata, proxy = %route.proxy.name(), error = %e, "Dial failed"),
                }
                metrics::record_dial_failure(route.proxy.name());
                metrics::record_connection(&rule_label, "failed");
                transition(&metadata, ConnState::Connecting, ConnState::Failed);
                return;
            }
        };

        let tracked = self
            .registry
            .register(metadata.clone(), upstream.chain, route.rule, route.payload);
        metrics::record_connection(&rule_label, "established");
        tracing::info!(
            conn_id = %tracked.id(),
            conn = %metadata,
            chain = ?tracked.chains(),
            rule = %rule_label,
            "Connection established"
        );
        transition(&metadata, ConnState::Connecting, ConnState::Established);

        let mut inbound = TrackedStream::new(stream, tracked.clone(), self.registry.clone());
        let mut outbound = upstream.stream;
        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
                if let Err(e) = result {
                    tracing::debug!(conn_id = %tracked.id(), error = %e, "Pump ended with error");
                }
            }
            _ = tracked.closed() => {
                tracing::debug!(conn_id = %tracked.id(), "Pump stopped by close request");
            }
        }
        transition(&metadata, ConnState::Established, ConnState::Closing);
        drop(inbound);
        drop(outbound);
        transition(&metadata, ConnState::Closing, ConnState::Closed);
    }

    /// Consume the listener queue until shutdown.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<InboundConn>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                next = queue.recv() => match next {
                    Some(conn) => {
                        tokio::spawn(self.clone().handle(conn));
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Dispatcher queue closed");
    }

    /// Stop background work, wait up to `grace` for connections to finish,
    /// then close the rest. Returns how many were closed forcibly.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.background.trigger();
        self.state.load().routing().stop_background();

        let deadline = time::Instant::now() + grace;
        while !self.registry.is_empty() && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(100)).await;
        }
        let closed = self.registry.close_all();
        if closed > 0 {
            tracing::warn!(closed, "Closed connections still open after grace period");
        }
        closed
    }
}

fn transition(metadata: &Metadata, from: ConnState, to: ConnState) {
    tracing::trace!(conn = %metadata, from = %from, to = %to, "Connection state");
}
