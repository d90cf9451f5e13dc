//! Configuration file watcher for hot reload.
//!
//! Editors and `cp` typically fire several modify events per save, and a
//! `touch` fires one with no change at all. Each event re-reads the file but
//! only content whose SHA-256 differs from the last accepted version is parsed
//! and sent, so one save applies at most one reload.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::config::loader::{parse_config, ConfigError};
use crate::config::schema::TunnelConfig;

/// Remembers the last accepted file content.
#[derive(Debug, Default)]
struct ChangeFilter {
    last: Option<String>,
}

impl ChangeFilter {
    fn seeded(path: &Path) -> Self {
        Self {
            last: fs::read(path).ok().map(|c| content_hash(&c)),
        }
    }

    /// `None` when the content matches the last accepted version. A parse
    /// failure is not remembered, so fixing the file back is still applied.
    fn check(&mut self, content: &[u8]) -> Option<Result<TunnelConfig, ConfigError>> {
        let hash = content_hash(content);
        if self.last.as_deref() == Some(hash.as_str()) {
            return None;
        }
        let parsed = parse_config(content);
        if parsed.is_ok() {
            self.last = Some(hash);
        }
        Some(parsed)
    }
}

fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Watches the config file and emits each validated new version.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<TunnelConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for validated configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<TunnelConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();
        let mut filter = ChangeFilter::seeded(&path);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let content = match fs::read(&path) {
                        Ok(content) => content,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "Config file unreadable");
                            return;
                        }
                    };
                    match filter.check(&content) {
                        None => tracing::debug!(path = %path.display(), "Config content unchanged"),
                        Some(Ok(config)) => {
                            tracing::info!(path = %path.display(), "Config file changed, reloading");
                            let _ = tx.send(config);
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Changed config rejected, keeping current configuration");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}
