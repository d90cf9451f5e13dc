//! URL latency probes.
//!
//! A probe opens a stream through the proxy under test to the test URL's
//! host and issues an HTTP `HEAD` request over it. For `https` URLs only the
//! proxied connection is timed, since TLS belongs to the upstream protocol.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use url::Url;

use crate::adapter::{DialContext, DialError, Proxy};
use crate::tunnel::{InboundType, Metadata};

/// Default URL used when a group or provider does not name one.
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Error type for latency probes.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid test url {0}")]
    InvalidUrl(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("probe request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("probe request could not be built: {0}")]
    Request(#[from] hyper::http::Error),
}

/// Parameters of one probe run.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub url: Url,
    pub timeout: Duration,
    /// Consecutive failures before the proxy is marked unhealthy.
    pub unhealthy_threshold: u32,
}

impl ProbeOptions {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let url = Url::parse(url).map_err(|_| ProbeError::InvalidUrl(url.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ProbeError::InvalidUrl(url.to_string()));
        }
        Ok(Self {
            url,
            timeout,
            unhealthy_threshold: 1,
        })
    }

    pub fn with_threshold(mut self, unhealthy_threshold: u32) -> Self {
        self.unhealthy_threshold = unhealthy_threshold;
        self
    }
}

/// Time one request through `proxy`. Does not record anything.
pub(crate) async fn measure(
    proxy: &Proxy,
    opts: &ProbeOptions,
    ctx: &DialContext,
) -> Result<Duration, ProbeError> {
    let host = opts
        .url
        .host_str()
        .ok_or_else(|| ProbeError::InvalidUrl(opts.url.to_string()))?;
    let port = opts
        .url
        .port_or_known_default()
        .ok_or_else(|| ProbeError::InvalidUrl(opts.url.to_string()))?;
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let destination = if bare.contains(':') {
        format!("[{}]:{}", bare, port)
    } else {
        format!("{}:{}", bare, port)
    };
    let metadata = Metadata::tcp(InboundType::Inner, None, &destination)
        .ok_or_else(|| ProbeError::InvalidUrl(opts.url.to_string()))?;

    let start = Instant::now();
    let conn = proxy.connect(&metadata, ctx).await?;
    if opts.url.scheme() == "https" {
        return Ok(start.elapsed());
    }

    let (mut sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(conn.stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::trace!(error = %e, "Probe connection closed with error");
        }
    });

    let authority = match opts.url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let mut target = opts.url.path().to_string();
    if let Some(query) = opts.url.query() {
        target.push('?');
        target.push_str(query);
    }
    let request = Request::builder()
        .method(Method::HEAD)
        .uri(target)
        .header(HOST, authority)
        .header(USER_AGENT, concat!("rule-tunnel/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    tracing::trace!(status = %response.status(), url = %opts.url, "Probe response");
    Ok(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(ProbeOptions::new("ftp://example.com", Duration::from_secs(1)).is_err());
        assert!(ProbeOptions::new("not a url", Duration::from_secs(1)).is_err());
        let opts = ProbeOptions::new(DEFAULT_TEST_URL, Duration::from_secs(1)).unwrap();
        assert_eq!(opts.unhealthy_threshold, 1);
        assert_eq!(opts.url.port_or_known_default(), Some(80));
    }
}
