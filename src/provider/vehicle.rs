//! Where provider content comes from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::provider::ProviderError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Vehicle kind as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VehicleType {
    File,
    #[serde(rename = "HTTP")]
    Http,
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleType::File => f.write_str("File"),
            VehicleType::Http => f.write_str("HTTP"),
        }
    }
}

/// Source of a provider's proxy list.
#[derive(Debug, Clone)]
pub enum Vehicle {
    /// Read from a local file.
    File { path: PathBuf },
    /// Download from a URL; the last good body is cached at `path`.
    Http {
        url: Url,
        path: PathBuf,
        client: reqwest::Client,
    },
}

impl Vehicle {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Vehicle::File { path: path.into() }
    }

    pub fn http(url: &str, path: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let url = Url::parse(url).map_err(|_| ProviderError::InvalidUrl(url.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProviderError::InvalidUrl(url.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("rule-tunnel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| ProviderError::Fetch {
                url: url.to_string(),
                source,
            })?;
        Ok(Vehicle::Http {
            url,
            path: path.into(),
            client,
        })
    }

    pub fn vehicle_type(&self) -> VehicleType {
        match self {
            Vehicle::File { .. } => VehicleType::File,
            Vehicle::Http { .. } => VehicleType::Http,
        }
    }

    /// Source file, or cache file for HTTP.
    pub fn path(&self) -> &Path {
        match self {
            Vehicle::File { path } | Vehicle::Http { path, .. } => path,
        }
    }

    /// Fetch the current content.
    pub async fn read(&self) -> Result<Vec<u8>, ProviderError> {
        match self {
            Vehicle::File { path } => read_file(path).await,
            Vehicle::Http { url, client, .. } => {
                let fetch_err = |source: reqwest::Error| ProviderError::Fetch {
                    url: url.to_string(),
                    source,
                };
                let response = client
                    .get(url.clone())
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(fetch_err)?;
                let body = response.bytes().await.map_err(fetch_err)?;
                Ok(body.to_vec())
            }
        }
    }

    /// Persist freshly fetched content. Only HTTP vehicles cache.
    pub async fn store(&self, content: &[u8]) -> Result<(), ProviderError> {
        let Vehicle::Http { path, .. } = self else {
            return Ok(());
        };
        let io_err = |source: std::io::Error| ProviderError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}

pub(crate) async fn read_file(path: &Path) -> Result<Vec<u8>, ProviderError> {
    tokio::fs::read(path).await.map_err(|source| ProviderError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_vehicle_requires_http_url() {
        assert!(Vehicle::http("ftp://example.com/p.toml", "p.toml").is_err());
        let vehicle = Vehicle::http("https://example.com/p.toml", "cache/p.toml").unwrap();
        assert_eq!(vehicle.vehicle_type(), VehicleType::Http);
        assert_eq!(vehicle.path(), Path::new("cache/p.toml"));
    }

    #[tokio::test]
    async fn file_vehicle_reads_and_never_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.toml");
        std::fs::write(&path, b"proxies = []").unwrap();

        let vehicle = Vehicle::file(&path);
        assert_eq!(vehicle.read().await.unwrap(), b"proxies = []");
        vehicle.store(b"other").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"proxies = []");
    }
}
