//! DNS resolution collaborator.
//!
//! The tunnel never implements DNS itself; it calls a [`Resolver`] with a
//! bounded timeout. [`SystemResolver`] delegates to the operating system.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Error type for DNS lookups.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lookup {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no usable address found for {0}")]
    NoAddress(String),

    #[error("lookup {0} timed out")]
    Timeout(String),
}

/// Hostname to IP resolution.
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// All addresses for `host`, IPv4 first. IPv6 results are dropped when
    /// `ipv6` is false.
    async fn lookup(&self, host: &str, ipv6: bool) -> Result<Vec<IpAddr>, ResolveError>;

    /// The preferred single address for `host`.
    async fn resolve_ip(&self, host: &str, ipv6: bool) -> Result<IpAddr, ResolveError> {
        self.lookup(host, ipv6)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NoAddress(host.to_string()))
    }
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str, ipv6: bool) -> Result<Vec<IpAddr>, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                source,
            })?;

        let (mut v4, v6): (Vec<IpAddr>, Vec<IpAddr>) =
            addrs.map(|a| a.ip()).partition(|ip| ip.is_ipv4());
        if ipv6 {
            v4.extend(v6);
        }
        if v4.is_empty() {
            return Err(ResolveError::NoAddress(host.to_string()));
        }
        Ok(v4)
    }
}

/// Resolve `host` with a deadline.
pub async fn resolve_with_timeout(
    resolver: &dyn Resolver,
    host: &str,
    ipv6: bool,
    timeout: Duration,
) -> Result<IpAddr, ResolveError> {
    match tokio::time::timeout(timeout, resolver.resolve_ip(host, ipv6)).await {
        Ok(result) => result,
        Err(_) => Err(ResolveError::Timeout(host.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literals_skip_lookup() {
        let ip = SystemResolver.resolve_ip("192.0.2.7", false).await.unwrap();
        assert_eq!(ip, "192.0.2.7".parse::<IpAddr>().unwrap());
    }

    #[derive(Debug)]
    struct Stalled;

    #[async_trait]
    impl Resolver for Stalled {
        async fn lookup(&self, _host: &str, _ipv6: bool) -> Result<Vec<IpAddr>, ResolveError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let err = resolve_with_timeout(&Stalled, "example.com", false, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Timeout(h) if h == "example.com"));
    }
}
