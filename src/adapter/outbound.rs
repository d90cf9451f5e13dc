//! Leaf outbound adapters.
//!
//! # Responsibilities
//! - Open the actual upstream TCP stream for a connection
//! - Resolve domain destinations through the configured resolver
//!
//! Protocol adapters with their own handshakes live outside this crate;
//! `Relay` stands in for them by carrying the stream to a fixed upstream.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::adapter::{BoxedStream, DialContext, DialError};
use crate::config::schema::ProxyConfig;
use crate::resolver::resolve_with_timeout;
use crate::tunnel::Metadata;

/// Leaf adapter variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Connect straight to the destination.
    Direct,
    /// Refuse every connection.
    Reject,
    /// Carry the stream to a fixed upstream endpoint.
    Relay { server: String, port: u16 },
}

impl Outbound {
    pub fn from_config(config: &ProxyConfig) -> Self {
        match config {
            ProxyConfig::Direct { .. } => Outbound::Direct,
            ProxyConfig::Reject { .. } => Outbound::Reject,
            ProxyConfig::Relay { server, port, .. } => Outbound::Relay {
                server: server.clone(),
                port: *port,
            },
        }
    }

    pub(crate) async fn connect(
        &self,
        name: &str,
        metadata: &Metadata,
        ctx: &DialContext,
    ) -> Result<BoxedStream, DialError> {
        match self {
            Outbound::Direct => {
                let stream = dial_tcp(&metadata.host, metadata.dst_ip, metadata.dst_port, ctx).await?;
                Ok(Box::new(stream))
            }
            Outbound::Reject => Err(DialError::Rejected(name.to_string())),
            Outbound::Relay { server, port } => {
                let stream = dial_tcp(server, None, *port, ctx).await?;
                tracing::trace!(
                    proxy = %name,
                    upstream = %format!("{}:{}", server, port),
                    destination = %metadata.remote_address(),
                    "Relay stream opened"
                );
                Ok(Box::new(stream))
            }
        }
    }
}

/// Connect to `host:port`, using `ip` when already known.
async fn dial_tcp(
    host: &str,
    ip: Option<IpAddr>,
    port: u16,
    ctx: &DialContext,
) -> Result<TcpStream, DialError> {
    let ip = match ip.or_else(|| host.parse().ok()) {
        Some(ip) => ip,
        None => resolve_with_timeout(ctx.resolver.as_ref(), host, ctx.ipv6, ctx.dns_timeout).await?,
    };
    let addr = SocketAddr::new(ip, port);

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| DialError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!(error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}
