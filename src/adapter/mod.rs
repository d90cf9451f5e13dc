//! Proxy abstraction.
//!
//! # Data Flow
//! ```text
//! Tunnel resolves a target name
//!     → Proxy (tagged variant)
//!         Leaf        → outbound.rs opens the upstream stream
//!         Selector    → pinned member
//!         UrlTest     → fastest alive member
//!         Fallback    → first member that connects
//!         LoadBalance → hashed or rotated member
//!     → ProxyConn { stream, chain }
//! ```
//!
//! # Design Decisions
//! - One `Proxy` type for leaves and groups; callers never downcast
//! - Groups hold `Arc<Proxy>` members, so nesting is plain recursion
//! - Health and delay live on every proxy, groups included
//! - Connect errors are returned as-is; only Fallback moves on to another member

pub mod group;
pub mod health;
pub mod outbound;
pub mod probe;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::schema::ProxyConfig;
use crate::observability::metrics;
use crate::resolver::{ResolveError, Resolver, SystemResolver};
use crate::tunnel::Metadata;

pub use group::{Fallback, GroupError, GroupMembers, LoadBalance, NameFilter, Selector, Strategy, UrlTest};
pub use health::{DelayRecord, DelayReport, Health};
pub use outbound::Outbound;
pub use probe::{ProbeError, ProbeOptions, DEFAULT_TEST_URL};

/// Name of the built-in direct proxy.
pub const DIRECT: &str = "DIRECT";
/// Name of the built-in reject proxy.
pub const REJECT: &str = "REJECT";
/// Name of the implicit selector used in global mode.
pub const GLOBAL: &str = "GLOBAL";

/// A bidirectional byte stream to an upstream.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Error type for outbound connects.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connection rejected by {0}")]
    Rejected(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("dial through {0} timed out")]
    Timeout(String),

    #[error("group {0} has no members")]
    EmptyGroup(String),

    #[error("every member of {group} failed, last error: {last}")]
    AllFailed { group: String, last: Box<DialError> },
}

/// Settings shared by every dial of one connection.
#[derive(Debug, Clone)]
pub struct DialContext {
    pub resolver: Arc<dyn Resolver>,
    pub ipv6: bool,
    pub dns_timeout: Duration,
}

impl Default for DialContext {
    fn default() -> Self {
        Self {
            resolver: Arc::new(SystemResolver),
            ipv6: false,
            dns_timeout: Duration::from_secs(5),
        }
    }
}

/// An established upstream stream plus the proxies it went through.
pub struct ProxyConn {
    pub stream: BoxedStream,
    /// Leaf first, then each enclosing group.
    pub chain: Vec<String>,
}

impl ProxyConn {
    fn new(stream: BoxedStream, leaf: &str) -> Self {
        Self {
            stream,
            chain: vec![leaf.to_string()],
        }
    }

    fn through(mut self, group: &str) -> Self {
        self.chain.push(group.to_string());
        self
    }
}

impl fmt::Debug for ProxyConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConn").field("chain", &self.chain).finish_non_exhaustive()
    }
}

/// Type tag reported for each proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProxyType {
    Direct,
    Reject,
    Relay,
    Selector,
    URLTest,
    Fallback,
    LoadBalance,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Variants a proxy can take.
#[derive(Debug)]
pub enum ProxyKind {
    Leaf(Outbound),
    Selector(Selector),
    UrlTest(UrlTest),
    Fallback(Fallback),
    LoadBalance(LoadBalance),
}

/// A named upstream path, leaf or group.
#[derive(Debug)]
pub struct Proxy {
    name: String,
    kind: ProxyKind,
    health: Health,
}

impl Proxy {
    pub fn new(name: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            health: Health::new(),
        }
    }

    /// Leaf proxy described by a config entry.
    pub fn leaf(config: &ProxyConfig) -> Self {
        Self::new(config.name(), ProxyKind::Leaf(Outbound::from_config(config)))
    }

    pub fn direct() -> Self {
        Self::new(DIRECT, ProxyKind::Leaf(Outbound::Direct))
    }

    pub fn reject() -> Self {
        Self::new(REJECT, ProxyKind::Leaf(Outbound::Reject))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ProxyKind {
        &self.kind
    }

    pub fn health(&self) -> &Health {
        &self.health
    }

    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    pub fn delay(&self) -> u32 {
        self.health.delays().delay
    }

    pub fn mean_delay(&self) -> u32 {
        self.health.delays().mean_delay
    }

    pub fn proxy_type(&self) -> ProxyType {
        match &self.kind {
            ProxyKind::Leaf(Outbound::Direct) => ProxyType::Direct,
            ProxyKind::Leaf(Outbound::Reject) => ProxyType::Reject,
            ProxyKind::Leaf(Outbound::Relay { .. }) => ProxyType::Relay,
            ProxyKind::Selector(_) => ProxyType::Selector,
            ProxyKind::UrlTest(_) => ProxyType::URLTest,
            ProxyKind::Fallback(_) => ProxyType::Fallback,
            ProxyKind::LoadBalance(_) => ProxyType::LoadBalance,
        }
    }

    /// The selector behind this proxy, or a typed error for any other variant.
    pub fn as_selector(&self) -> Result<&Selector, GroupError> {
        match &self.kind {
            ProxyKind::Selector(selector) => Ok(selector),
            _ => Err(GroupError::NotSelector(self.name.clone())),
        }
    }

    /// Member set of a group; `None` for leaves.
    pub fn group_members(&self) -> Option<&GroupMembers> {
        match &self.kind {
            ProxyKind::Leaf(_) => None,
            ProxyKind::Selector(g) => Some(g.members()),
            ProxyKind::UrlTest(g) => Some(g.members()),
            ProxyKind::Fallback(g) => Some(g.members()),
            ProxyKind::LoadBalance(g) => Some(g.members()),
        }
    }

    /// Name of the member a group would currently use.
    pub fn now(&self) -> Option<String> {
        let member = match &self.kind {
            ProxyKind::Selector(g) => g.now(),
            ProxyKind::UrlTest(g) => g.now(),
            ProxyKind::Fallback(g) => g.now(),
            ProxyKind::Leaf(_) | ProxyKind::LoadBalance(_) => None,
        };
        member.map(|p| p.name().to_string())
    }

    /// Open an upstream stream for `metadata`.
    pub fn connect<'a>(
        &'a self,
        metadata: &'a Metadata,
        ctx: &'a DialContext,
    ) -> BoxFuture<'a, Result<ProxyConn, DialError>> {
        Box::pin(async move {
            match &self.kind {
                ProxyKind::Leaf(outbound) => {
                    let stream = outbound.connect(&self.name, metadata, ctx).await?;
                    Ok(ProxyConn::new(stream, &self.name))
                }
                ProxyKind::Selector(g) => self.connect_member(g.now(), metadata, ctx).await,
                ProxyKind::UrlTest(g) => self.connect_member(g.now(), metadata, ctx).await,
                ProxyKind::LoadBalance(g) => {
                    self.connect_member(g.pick(metadata), metadata, ctx).await
                }
                ProxyKind::Fallback(g) => {
                    let mut last = None;
                    for member in g.candidates() {
                        match member.connect(metadata, ctx).await {
                            Ok(conn) => return Ok(conn.through(&self.name)),
                            Err(e) => {
                                tracing::debug!(
                                    group = %self.name,
                                    member = %member.name(),
                                    error = %e,
                                    "Fallback member failed, trying next"
                                );
                                last = Some(e);
                            }
                        }
                    }
                    match last {
                        Some(e) => Err(DialError::AllFailed {
                            group: self.name.clone(),
                            last: Box::new(e),
                        }),
                        None => Err(DialError::EmptyGroup(self.name.clone())),
                    }
                }
            }
        })
    }

    async fn connect_member(
        &self,
        member: Option<Arc<Proxy>>,
        metadata: &Metadata,
        ctx: &DialContext,
    ) -> Result<ProxyConn, DialError> {
        let member = member.ok_or_else(|| DialError::EmptyGroup(self.name.clone()))?;
        let conn = member.connect(metadata, ctx).await?;
        Ok(conn.through(&self.name))
    }

    /// Measure latency through this proxy and record the outcome.
    ///
    /// On failure the previous delay and mean delay are kept.
    pub async fn probe(&self, opts: &ProbeOptions, ctx: &DialContext) -> Result<DelayReport, ProbeError> {
        let outcome = match tokio::time::timeout(opts.timeout, probe::measure(self, opts, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(opts.timeout)),
        };

        match outcome {
            Ok(elapsed) => {
                let report = self.health.record_success(elapsed);
                metrics::record_probe(&self.name, Some(report.delay));
                tracing::debug!(proxy = %self.name, delay = report.delay, mean_delay = report.mean_delay, "Probe succeeded");
                Ok(report)
            }
            Err(e) => {
                self.health.record_failure(opts.unhealthy_threshold);
                metrics::record_probe(&self.name, None);
                tracing::debug!(proxy = %self.name, error = %e, "Probe failed");
                Err(e)
            }
        }
    }
}
