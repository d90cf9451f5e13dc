//! Connection metadata extracted by inbound listeners.
//!
//! Metadata is the only input to rule matching, so everything a matcher may
//! inspect lives here. It is cheap to clone and serializes to the shape the
//! reporting façade expects.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport network of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Kind of inbound listener that accepted a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundType {
    Http,
    Socks,
    Mixed,
    Redir,
    Tproxy,
    Tunnel,
    /// Connections opened by the tunnel itself (latency probes).
    Inner,
}

impl fmt::Display for InboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InboundType::Http => "http",
            InboundType::Socks => "socks",
            InboundType::Mixed => "mixed",
            InboundType::Redir => "redir",
            InboundType::Tproxy => "tproxy",
            InboundType::Tunnel => "tunnel",
            InboundType::Inner => "inner",
        };
        f.write_str(s)
    }
}

/// Routing-relevant facts about one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub network: Network,
    #[serde(rename = "type")]
    pub inbound_type: InboundType,
    #[serde(rename = "sourceIP")]
    pub src_ip: Option<IpAddr>,
    #[serde(rename = "sourcePort")]
    pub src_port: u16,
    #[serde(rename = "destinationIP")]
    pub dst_ip: Option<IpAddr>,
    #[serde(rename = "destinationPort")]
    pub dst_port: u16,
    /// Destination domain; empty when the client addressed an IP directly.
    pub host: String,
    #[serde(rename = "processPath")]
    pub process_name: Option<String>,
    #[serde(rename = "inboundName")]
    pub inbound_name: Option<String>,
}

impl Metadata {
    /// Metadata for a TCP connection from `source` to `destination` (`host:port`).
    ///
    /// The destination host is stored as an IP when it parses as one, otherwise
    /// as a normalized domain.
    pub fn tcp(inbound_type: InboundType, source: Option<SocketAddr>, destination: &str) -> Option<Self> {
        let (host, port) = split_host_port(destination)?;
        let mut metadata = Self {
            network: Network::Tcp,
            inbound_type,
            src_ip: source.map(|s| s.ip()),
            src_port: source.map(|s| s.port()).unwrap_or(0),
            dst_ip: None,
            dst_port: port,
            host: String::new(),
            process_name: None,
            inbound_name: None,
        };
        match host.parse::<IpAddr>() {
            Ok(ip) => metadata.dst_ip = Some(ip),
            Err(_) => metadata.host = normalize_host(host),
        }
        Some(metadata)
    }

    /// Attach the name of the listener that accepted the connection.
    pub fn with_inbound_name(mut self, name: impl Into<String>) -> Self {
        self.inbound_name = Some(name.into());
        self
    }

    /// Attach the originating process name.
    pub fn with_process(mut self, name: impl Into<String>) -> Self {
        self.process_name = Some(name.into());
        self
    }

    /// True when the destination is known only by domain name.
    pub fn needs_resolve(&self) -> bool {
        self.dst_ip.is_none() && !self.host.is_empty()
    }

    /// Destination as `host:port`, preferring the domain when present.
    pub fn remote_address(&self) -> String {
        if !self.host.is_empty() {
            format!("{}:{}", self.host, self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            SocketAddr::new(ip, self.dst_port).to_string()
        } else {
            format!(":{}", self.dst_port)
        }
    }

    pub fn source_address(&self) -> String {
        match self.src_ip {
            Some(ip) => SocketAddr::new(ip, self.src_port).to_string(),
            None => "-".to_string(),
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} --> {}", self.source_address(), self.remote_address())
    }
}

/// Lowercase a domain and trim a trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Split `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        // Re-borrow the host portion so callers get an unbracketed IP string.
        let idx = address.rfind(':')?;
        let host = address[..idx].trim_start_matches('[').trim_end_matches(']');
        return Some((host, addr.port()));
    }
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}
