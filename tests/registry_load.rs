//! Registry bookkeeping with many concurrent connections.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rule_tunnel::statistic::RegistrySnapshot;
use rule_tunnel::tunnel::{InboundConn, InboundType, Metadata};
use rule_tunnel::Tunnel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod common;

const CONNECTIONS: usize = 64;
const CHUNK: usize = 512;
const ROUNDS: usize = 8;

fn metadata(port: u16, n: usize) -> Metadata {
    let source = format!("10.1.{}.{}:{}", n / 250, n % 250 + 1, 30000 + n);
    Metadata::tcp(InboundType::Tunnel, Some(source.parse().unwrap()), &format!("127.0.0.1:{}", port)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn totals_match_per_connection_counters() {
    let echo = common::start_echo_server().await;
    let home = tempfile::tempdir().unwrap();
    let tunnel = Arc::new(Tunnel::new(
        common::build_state(r#"rules = ["MATCH,DIRECT"]"#, home.path()).await,
    ));

    let mut clients = Vec::new();
    let mut pumps = Vec::new();
    for n in 0..CONNECTIONS {
        let (client, server) = tokio::io::duplex(4096);
        pumps.push(tokio::spawn(tunnel.clone().handle(InboundConn {
            stream: Box::new(server),
            metadata: metadata(echo.port(), n),
        })));
        clients.push(client);
    }

    let running = Arc::new(AtomicBool::new(true));
    let observer = {
        let tunnel = tunnel.clone();
        let running = running.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while running.load(Ordering::Relaxed) {
                seen.push(tunnel.registry().snapshot());
                tokio::task::yield_now().await;
            }
            seen
        })
    };

    let workers: Vec<_> = clients
        .into_iter()
        .map(|mut client| {
            tokio::spawn(async move {
                let payload = vec![7u8; CHUNK];
                let mut back = vec![0u8; CHUNK];
                for _ in 0..ROUNDS {
                    client.write_all(&payload).await.unwrap();
                    client.read_exact(&mut back).await.unwrap();
                }
                client
            })
        })
        .collect();

    let mut finished = Vec::new();
    for worker in workers {
        finished.push(worker.await.unwrap());
    }
    running.store(false, Ordering::Relaxed);
    let observed = observer.await.unwrap();

    let snapshot = tunnel.registry().snapshot();
    assert_monotonic(&observed, &snapshot);
    assert_eq!(snapshot.connections.len(), CONNECTIONS);
    let expected = (CONNECTIONS * CHUNK * ROUNDS) as u64;
    assert_eq!(snapshot.upload_total, expected);
    assert_eq!(snapshot.download_total, expected);
    let per_conn_up: u64 = snapshot.connections.iter().map(|c| c.upload).sum();
    let per_conn_down: u64 = snapshot.connections.iter().map(|c| c.download).sum();
    assert_eq!(per_conn_up, expected);
    assert_eq!(per_conn_down, expected);

    let mut ids: Vec<_> = snapshot.connections.iter().map(|c| c.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), CONNECTIONS);

    drop(finished);
    for pump in pumps {
        pump.await.unwrap();
    }
    assert!(tunnel.registry().is_empty());
    assert_eq!(tunnel.registry().snapshot().upload_total, expected);

    echo.stop().await;
}

/// Every snapshot taken while traffic flowed lists only registered ids, and
/// no counter ever goes backwards.
fn assert_monotonic(observed: &[RegistrySnapshot], last: &RegistrySnapshot) {
    assert!(!observed.is_empty());
    let registered: HashSet<_> = last.connections.iter().map(|c| c.id).collect();
    let mut per_conn: HashMap<_, (u64, u64)> = HashMap::new();
    let (mut up, mut down) = (0, 0);

    for snapshot in observed.iter().chain(std::iter::once(last)) {
        assert!(snapshot.upload_total >= up && snapshot.download_total >= down);
        up = snapshot.upload_total;
        down = snapshot.download_total;

        for conn in &snapshot.connections {
            assert!(registered.contains(&conn.id), "unknown id {}", conn.id);
            let prev = per_conn.entry(conn.id).or_insert((0, 0));
            assert!(conn.upload >= prev.0 && conn.download >= prev.1);
            *prev = (conn.upload, conn.download);
        }
    }
}

#[tokio::test]
async fn shutdown_closes_stragglers_after_grace() {
    let echo = common::start_echo_server().await;
    let home = tempfile::tempdir().unwrap();
    let tunnel = Arc::new(Tunnel::new(
        common::build_state(r#"rules = ["MATCH,DIRECT"]"#, home.path()).await,
    ));

    let (mut client, server) = tokio::io::duplex(1024);
    let pump = tokio::spawn(tunnel.clone().handle(InboundConn {
        stream: Box::new(server),
        metadata: metadata(echo.port(), 0),
    }));
    assert_eq!(common::round_trip(&mut client, b"idle").await, b"idle");

    let started = tokio::time::Instant::now();
    let closed = tunnel.shutdown(Duration::from_millis(300)).await;
    assert_eq!(closed, 1);
    assert!(started.elapsed() >= Duration::from_millis(300));

    pump.await.unwrap();
    assert!(common::closed_by_peer(&mut client).await);
    assert!(tunnel.registry().is_empty());

    echo.stop().await;
}
