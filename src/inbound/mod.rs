//! Inbound listener subsystem.
//!
//! # Data Flow
//! ```text
//! [[inbounds]] / general port options
//!     → ListenerManager (reconcile by listener name)
//!         unchanged → keep running
//!         changed   → stop old accept loop, bind new
//!     → listener.rs accept loop
//!     → handshake.rs framing (by inbound type)
//!     → bounded queue → Tunnel::run
//! ```
//!
//! # Design Decisions
//! - Stopping a listener closes only its socket; accepted connections live
//!   in their own tasks and are never severed by a recreate
//! - Named inbounds and port listeners are reconciled independently
//! - A bind failure is returned to the caller, which decides whether it is
//!   fatal; the remaining listeners are still brought up

pub mod handshake;
pub mod listener;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::config::InboundConfig;
use crate::lifecycle::Shutdown;
use crate::tunnel::{GeneralSettings, InboundConn, InboundType};

pub use handshake::{HandshakeError, Handshakes, InboundHandshake, ListenerSpec, TunnelHandshake};
pub use listener::{Listener, ListenerError};

/// Handshakes allowed to run at once across all listeners.
const DEFAULT_MAX_PENDING: usize = 1024;

/// Ports of the shorthand listeners; 0 disables one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ports {
    pub http: u16,
    pub socks: u16,
    pub redir: u16,
    pub tproxy: u16,
    pub mixed: u16,
}

impl Ports {
    pub fn from_general(general: &GeneralSettings) -> Self {
        Self {
            http: general.port,
            socks: general.socks_port,
            redir: general.redir_port,
            tproxy: general.tproxy_port,
            mixed: general.mixed_port,
        }
    }

    fn specs(&self, listen: &str) -> Vec<ListenerSpec> {
        [
            ("DEFAULT-HTTP", InboundType::Http, self.http),
            ("DEFAULT-SOCKS", InboundType::Socks, self.socks),
            ("DEFAULT-REDIR", InboundType::Redir, self.redir),
            ("DEFAULT-TPROXY", InboundType::Tproxy, self.tproxy),
            ("DEFAULT-MIXED", InboundType::Mixed, self.mixed),
        ]
        .into_iter()
        .filter(|(_, _, port)| *port != 0)
        .map(|(name, inbound_type, port)| ListenerSpec {
            name: name.to_string(),
            inbound_type,
            listen: listen.to_string(),
            port,
            target: None,
        })
        .collect()
    }
}

/// Address the shorthand port listeners bind.
pub fn port_bind_ip(allow_lan: bool, bind_address: &str) -> String {
    if !allow_lan {
        return "127.0.0.1".to_string();
    }
    match bind_address {
        "*" | "" => "0.0.0.0".to_string(),
        addr => addr.to_string(),
    }
}

/// A running listener as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub inbound_type: InboundType,
    pub listen: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug)]
struct Running {
    spec: ListenerSpec,
    local_addr: SocketAddr,
    stop: Shutdown,
    task: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.stop.trigger();
        // The socket is released once the accept loop returns.
        if let Err(e) = self.task.await {
            tracing::warn!(listener = %self.spec.name, error = %e, "Listener task ended abnormally");
        }
    }

    fn info(&self) -> InboundInfo {
        InboundInfo {
            name: self.spec.name.clone(),
            inbound_type: self.spec.inbound_type,
            listen: self.local_addr.ip().to_string(),
            port: self.local_addr.port(),
            target: self.spec.target.clone(),
        }
    }
}

/// Owns every bound inbound socket.
#[derive(Debug)]
pub struct ListenerManager {
    queue: mpsc::Sender<InboundConn>,
    handshakes: Handshakes,
    limit: Arc<Semaphore>,
    named: Mutex<BTreeMap<String, Running>>,
    ports: Mutex<BTreeMap<String, Running>>,
}

impl ListenerManager {
    pub fn new(queue: mpsc::Sender<InboundConn>, handshakes: Handshakes) -> Self {
        Self {
            queue,
            handshakes,
            limit: Arc::new(Semaphore::new(DEFAULT_MAX_PENDING)),
            named: Mutex::new(BTreeMap::new()),
            ports: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bring the named listeners in line with `inbounds`.
    pub async fn recreate_listeners(&self, inbounds: &[InboundConfig]) -> Result<(), ListenerError> {
        let wanted = inbounds
            .iter()
            .map(|i| ListenerSpec {
                name: i.name.clone(),
                inbound_type: i.inbound_type,
                listen: i.listen.clone(),
                port: i.port,
                target: i.target.clone(),
            })
            .collect();
        let mut running = self.named.lock().await;
        self.reconcile(&mut running, wanted).await
    }

    /// Bring the shorthand port listeners in line with `ports`.
    pub async fn recreate_ports_listeners(
        &self,
        ports: Ports,
        allow_lan: bool,
        bind_address: &str,
    ) -> Result<(), ListenerError> {
        let wanted = ports.specs(&port_bind_ip(allow_lan, bind_address));
        let mut running = self.ports.lock().await;
        self.reconcile(&mut running, wanted).await
    }

    /// Every running listener, named ones first.
    pub async fn inbounds(&self) -> Vec<InboundInfo> {
        let named = self.named.lock().await;
        let ports = self.ports.lock().await;
        named.values().chain(ports.values()).map(Running::info).collect()
    }

    /// Close every listening socket.
    pub async fn stop_all(&self) {
        let named = std::mem::take(&mut *self.named.lock().await);
        let ports = std::mem::take(&mut *self.ports.lock().await);
        for running in named.into_values().chain(ports.into_values()) {
            running.stop().await;
        }
    }

    async fn reconcile(
        &self,
        running: &mut BTreeMap<String, Running>,
        wanted: Vec<ListenerSpec>,
    ) -> Result<(), ListenerError> {
        let stale: Vec<String> = running
            .iter()
            .filter(|(name, r)| !wanted.iter().any(|w| &w.name == *name && *w == r.spec))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(old) = running.remove(&name) {
                old.stop().await;
            }
        }

        let mut first_error = None;
        for spec in wanted {
            if running.contains_key(&spec.name) {
                continue;
            }
            let Some(handshake) = self.handshakes.get(spec.inbound_type) else {
                tracing::warn!(
                    listener = %spec.name,
                    inbound_type = %spec.inbound_type,
                    "No handshake for inbound type, listener skipped"
                );
                continue;
            };
            let name = spec.name.clone();
            match Listener::bind(spec.clone()).await {
                Ok(listener) => {
                    let stop = Shutdown::new();
                    let local_addr = listener.local_addr();
                    let task = tokio::spawn(listener.run(
                        handshake,
                        self.queue.clone(),
                        self.limit.clone(),
                        stop.subscribe(),
                    ));
                    running.insert(
                        name,
                        Running {
                            spec,
                            local_addr,
                            stop,
                            task,
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(listener = %name, error = %e, "Listener bind failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
