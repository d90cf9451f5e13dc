//! Per-connection tracking.
//!
//! # Responsibilities
//! - Hold the identity and counters of one established connection
//! - Carry the close signal the pump selects on
//! - Count bytes as they pass through the inbound stream

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use uuid::Uuid;

use crate::rules::RuleType;
use crate::statistic::registry::{ConnectionRegistry, ConnectionSnapshot};
use crate::tunnel::Metadata;

/// One registered connection.
#[derive(Debug)]
pub struct TrackedConnection {
    id: Uuid,
    metadata: Metadata,
    chains: Vec<String>,
    rule: Option<RuleType>,
    rule_payload: String,
    start: DateTime<Utc>,
    upload: AtomicU64,
    download: AtomicU64,
    close_tx: watch::Sender<bool>,
}

impl TrackedConnection {
    pub(crate) fn new(metadata: Metadata, chains: Vec<String>, rule: Option<RuleType>, rule_payload: String) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            metadata,
            chains,
            rule,
            rule_payload,
            start: Utc::now(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            close_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn chains(&self) -> &[String] {
        &self.chains
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    /// Signal the pump to stop.
    pub(crate) fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            metadata: self.metadata.clone(),
            upload: self.upload(),
            download: self.download(),
            start: self.start,
            chains: self.chains.clone(),
            rule: self.rule.map(|r| r.to_string()).unwrap_or_default(),
            rule_payload: self.rule_payload.clone(),
        }
    }
}

/// Inbound stream wrapper that feeds the registry counters.
///
/// Reads are client → upstream (upload); writes are upstream → client
/// (download). Dropping it unregisters the connection.
#[derive(Debug)]
pub struct TrackedStream<S> {
    inner: S,
    conn: Arc<TrackedConnection>,
    registry: Arc<ConnectionRegistry>,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, conn: Arc<TrackedConnection>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { inner, conn, registry }
    }

    pub fn connection(&self) -> &Arc<TrackedConnection> {
        &self.conn
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.registry.unregister(self.conn.id());
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                self.conn.upload.fetch_add(n, Ordering::Relaxed);
                self.registry.add_upload(n);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                self.conn.download.fetch_add(*n as u64, Ordering::Relaxed);
                self.registry.add_download(*n as u64);
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::InboundType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn metadata() -> Metadata {
        Metadata::tcp(InboundType::Tunnel, None, "example.com:443").unwrap()
    }

    #[tokio::test]
    async fn counts_both_directions_and_unregisters_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = registry.register(metadata(), vec!["DIRECT".into()], None, String::new());
        let (client, mut peer) = tokio::io::duplex(64);
        let mut tracked = TrackedStream::new(client, conn.clone(), registry.clone());

        peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tracked.read_exact(&mut buf).await.unwrap();
        tracked.write_all(b"world!").await.unwrap();

        assert_eq!(conn.upload(), 5);
        assert_eq!(conn.download(), 6);
        assert_eq!(registry.len(), 1);

        drop(tracked);
        assert_eq!(registry.len(), 0);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.upload_total, 5);
        assert_eq!(snapshot.download_total, 6);
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let conn = Arc::new(TrackedConnection::new(metadata(), vec![], None, String::new()));
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
    }
}
