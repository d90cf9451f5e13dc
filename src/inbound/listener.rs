//! One bound inbound socket and its accept loop.
//!
//! # Responsibilities
//! - Bind the listener's address
//! - Accept connections until told to stop
//! - Bound concurrent handshakes via semaphore
//! - Hand framed connections to the dispatcher queue

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time;

use crate::inbound::handshake::{HandshakeError, InboundHandshake, ListenerSpec};
use crate::tunnel::InboundConn;

/// How long a client may take to complete framing.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A bound listener ready to accept.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    spec: Arc<ListenerSpec>,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(spec: ListenerSpec) -> Result<Self, ListenerError> {
        let ip: IpAddr = spec
            .listen
            .parse()
            .map_err(|_| ListenerError::InvalidAddress(spec.listen.clone()))?;
        let addr = SocketAddr::new(ip, spec.port);

        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = inner.local_addr().map_err(|source| ListenerError::Bind { addr, source })?;

        tracing::info!(
            listener = %spec.name,
            inbound_type = %spec.inbound_type,
            address = %local_addr,
            "Listener bound"
        );

        Ok(Self {
            inner,
            spec: Arc::new(spec),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` fires. The socket is closed on return;
    /// connections already handed off are unaffected.
    pub async fn run(
        self,
        handshake: Arc<dyn InboundHandshake>,
        queue: mpsc::Sender<InboundConn>,
        limit: Arc<Semaphore>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.inner.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(listener = %self.spec.name, error = %e, "Accept failed");
                        time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            tracing::debug!(
                listener = %self.spec.name,
                peer_addr = %peer,
                available_permits = limit.available_permits(),
                "Connection accepted"
            );

            let spec = self.spec.clone();
            let handshake = handshake.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let framed = frame(handshake.as_ref(), stream, peer, &spec).await;
                drop(permit);
                match framed {
                    Ok(conn) => {
                        if queue.send(conn).await.is_err() {
                            tracing::debug!(listener = %spec.name, "Dispatcher gone, dropping connection");
                        }
                    }
                    Err(e) => tracing::debug!(listener = %spec.name, peer_addr = %peer, error = %e, "Handshake failed"),
                }
            });
        }
        tracing::info!(listener = %self.spec.name, address = %self.local_addr, "Listener stopped");
    }
}

async fn frame(
    handshake: &dyn InboundHandshake,
    stream: TcpStream,
    peer: SocketAddr,
    spec: &ListenerSpec,
) -> Result<InboundConn, HandshakeError> {
    let (stream, metadata) = time::timeout(HANDSHAKE_TIMEOUT, handshake.accept(stream, peer, spec))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    Ok(InboundConn { stream, metadata })
}
