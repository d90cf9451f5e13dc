//! Load-balancing group.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::adapter::group::GroupMembers;
use crate::adapter::Proxy;
use crate::tunnel::Metadata;

/// How a [`LoadBalance`] group spreads connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Same source address, same member, while the alive set is unchanged.
    #[default]
    ConsistentHashing,
    RoundRobin,
}

#[derive(Debug)]
pub struct LoadBalance {
    members: GroupMembers,
    strategy: Strategy,
    counter: AtomicUsize,
}

impl LoadBalance {
    pub fn new(members: GroupMembers, strategy: Strategy) -> Self {
        Self {
            members,
            strategy,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn members(&self) -> &GroupMembers {
        &self.members
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Member to carry `metadata`. Unhealthy members are skipped unless every
    /// member is unhealthy.
    pub fn pick(&self, metadata: &Metadata) -> Option<Arc<Proxy>> {
        let members = self.members.resolve();
        if members.is_empty() {
            return None;
        }
        let alive: Vec<Arc<Proxy>> = members.iter().filter(|p| p.is_alive()).cloned().collect();
        let pool = if alive.is_empty() { members } else { alive };

        let index = match self.strategy {
            Strategy::ConsistentHashing => jump_hash(hash_key(metadata), pool.len()),
            Strategy::RoundRobin => self.counter.fetch_add(1, Ordering::Relaxed) % pool.len(),
        };
        pool.get(index).cloned()
    }
}

fn hash_key(metadata: &Metadata) -> u64 {
    let mut hasher = DefaultHasher::new();
    match metadata.src_ip {
        Some(ip) => ip.hash(&mut hasher),
        None => metadata.host.hash(&mut hasher),
    }
    hasher.finish()
}

/// Jump consistent hash (Lamping & Veach).
fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Outbound, ProxyKind};
    use crate::tunnel::InboundType;
    use std::net::SocketAddr;

    fn relay(name: &str) -> Arc<Proxy> {
        Arc::new(Proxy::new(
            name,
            ProxyKind::Leaf(Outbound::Relay {
                server: "127.0.0.1".into(),
                port: 1,
            }),
        ))
    }

    fn from(src: &str) -> Metadata {
        let src: SocketAddr = src.parse().unwrap();
        Metadata::tcp(InboundType::Tunnel, Some(src), "example.com:443").unwrap()
    }

    #[test]
    fn round_robin_rotates() {
        let lb = LoadBalance::new(
            GroupMembers::from_proxies(vec![relay("a"), relay("b")]),
            Strategy::RoundRobin,
        );
        let m = from("10.0.0.1:1000");
        assert_eq!(lb.pick(&m).unwrap().name(), "a");
        assert_eq!(lb.pick(&m).unwrap().name(), "b");
        assert_eq!(lb.pick(&m).unwrap().name(), "a");
    }

    #[test]
    fn consistent_hashing_is_stable_per_source() {
        let lb = LoadBalance::new(
            GroupMembers::from_proxies(vec![relay("a"), relay("b"), relay("c")]),
            Strategy::ConsistentHashing,
        );
        let first = lb.pick(&from("10.0.0.7:1000")).unwrap();
        for port in 1001..1020 {
            let again = lb.pick(&from(&format!("10.0.0.7:{}", port))).unwrap();
            assert_eq!(again.name(), first.name());
        }
    }

    #[test]
    fn unhealthy_members_are_skipped() {
        let a = relay("a");
        a.health().record_failure(1);
        let lb = LoadBalance::new(
            GroupMembers::from_proxies(vec![a, relay("b")]),
            Strategy::RoundRobin,
        );
        let m = from("10.0.0.1:1000");
        assert_eq!(lb.pick(&m).unwrap().name(), "b");
        assert_eq!(lb.pick(&m).unwrap().name(), "b");
    }

    #[test]
    fn jump_hash_stays_in_range() {
        for key in 0..500u64 {
            assert!(jump_hash(key, 7) < 7);
        }
        assert_eq!(jump_hash(42, 1), 0);
    }
}
