//! Inbound framing.
//!
//! Protocol framing (SOCKS, HTTP CONNECT, transparent redirects) plugs in
//! through [`InboundHandshake`]. The only framing built in is `tunnel`, which
//! forwards every connection to a fixed destination.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::adapter::BoxedStream;
use crate::tunnel::{split_host_port, InboundType, Metadata};

/// Error type for inbound handshakes.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid destination {0}")]
    InvalidDestination(String),

    #[error("listener {0} has no target")]
    MissingTarget(String),

    #[error("handshake timed out")]
    Timeout,
}

/// What a handshake knows about the listener it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub name: String,
    pub inbound_type: InboundType,
    pub listen: String,
    pub port: u16,
    pub target: Option<String>,
}

/// Turns an accepted socket into a stream plus its routing metadata.
#[async_trait]
pub trait InboundHandshake: Send + Sync + fmt::Debug {
    async fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listener: &ListenerSpec,
    ) -> Result<(BoxedStream, Metadata), HandshakeError>;
}

/// Forwards every connection to the listener's fixed target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelHandshake;

#[async_trait]
impl InboundHandshake for TunnelHandshake {
    async fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        listener: &ListenerSpec,
    ) -> Result<(BoxedStream, Metadata), HandshakeError> {
        let target = listener
            .target
            .as_deref()
            .ok_or_else(|| HandshakeError::MissingTarget(listener.name.clone()))?;
        if split_host_port(target).is_none() {
            return Err(HandshakeError::InvalidDestination(target.to_string()));
        }
        let metadata = Metadata::tcp(InboundType::Tunnel, Some(peer), target)
            .ok_or_else(|| HandshakeError::InvalidDestination(target.to_string()))?
            .with_inbound_name(listener.name.clone());
        Ok((Box::new(stream), metadata))
    }
}

/// Handshakes keyed by inbound type.
#[derive(Debug, Clone)]
pub struct Handshakes {
    by_type: HashMap<InboundType, Arc<dyn InboundHandshake>>,
}

impl Handshakes {
    /// No framing registered.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    pub fn register(mut self, inbound_type: InboundType, handshake: Arc<dyn InboundHandshake>) -> Self {
        self.by_type.insert(inbound_type, handshake);
        self
    }

    pub fn get(&self, inbound_type: InboundType) -> Option<Arc<dyn InboundHandshake>> {
        self.by_type.get(&inbound_type).cloned()
    }
}

impl Default for Handshakes {
    fn default() -> Self {
        Self::empty().register(InboundType::Tunnel, Arc::new(TunnelHandshake))
    }
}
